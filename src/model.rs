//! Records produced by the accounting pipeline and stored by the gateway.

use crate::pricing::Cost;
use crate::request::{Role, Usage};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::str::FromStr;
use uuid::Uuid;

/// Allowed gap between `quantity × unit_price` and `total` before a line
/// item is flagged.
pub const LINE_TOTAL_TOLERANCE: Decimal = Decimal::from_parts(1, 0, 0, false, 2);

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: Uuid,
    pub customer_name: Option<String>,
    pub vendor_name: Option<String>,
    pub invoice_number: Option<String>,
    pub invoice_date: Option<NaiveDate>,
    pub due_date: Option<NaiveDate>,
    pub amount: Option<Decimal>,
    /// Document order.
    pub line_items: Vec<LineItem>,
}

impl Invoice {
    pub fn new() -> Self {
        Invoice {
            id: Uuid::now_v7(),
            customer_name: None,
            vendor_name: None,
            invoice_number: None,
            invoice_date: None,
            due_date: None,
            amount: None,
            line_items: Vec::new(),
        }
    }

    /// Missing customer name, vendor name, or invoice number.
    pub fn is_low_confidence(&self) -> bool {
        self.customer_name.is_none() || self.vendor_name.is_none() || self.invoice_number.is_none()
    }

    /// Sum of line totals, if every line has one.
    pub fn line_items_total(&self) -> Option<Decimal> {
        self.line_items
            .iter()
            .map(|item| item.total)
            .sum::<Option<Decimal>>()
    }

    /// Header without its line items, as stored by `create_invoice`.
    pub fn header(&self) -> Invoice {
        Invoice {
            line_items: Vec::new(),
            ..self.clone()
        }
    }
}

impl Default for Invoice {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub id: Uuid,
    /// Back-reference to the owning invoice.
    pub invoice_id: Uuid,
    pub description: String,
    pub quantity: Option<Decimal>,
    pub unit_price: Option<Decimal>,
    pub total: Option<Decimal>,
}

impl LineItem {
    pub fn new(invoice_id: Uuid, description: impl Into<String>) -> Self {
        LineItem {
            id: Uuid::now_v7(),
            invoice_id,
            description: description.into(),
            quantity: None,
            unit_price: None,
            total: None,
        }
    }

    pub fn expected_total(&self) -> Option<Decimal> {
        Some(self.quantity? * self.unit_price?)
    }

    /// False only when all three numbers are present and disagree by more
    /// than [`LINE_TOTAL_TOLERANCE`].
    pub fn is_consistent(&self) -> bool {
        match (self.expected_total(), self.total) {
            (Some(expected), Some(total)) => (expected - total).abs() <= LINE_TOTAL_TOLERANCE,
            _ => true,
        }
    }
}

/// Tokens spent on one processed turn and what they cost.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TokenUsageRecord {
    pub id: Uuid,
    /// Nulled when the invoice is deleted; the record itself survives.
    pub invoice_id: Option<Uuid>,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    /// Exact decimal string.
    pub cost: String,
    pub estimated: bool,
    pub created_at: DateTime<Utc>,
}

impl TokenUsageRecord {
    pub fn new(invoice_id: Option<Uuid>, usage: Usage, cost: &Cost) -> Self {
        TokenUsageRecord {
            id: Uuid::now_v7(),
            invoice_id,
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens(),
            cost: cost.to_decimal_string(),
            estimated: cost.estimated,
            created_at: Utc::now(),
        }
    }
}

/// Tokens not re-spent upstream because a cached answer was replayed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InputTokenSavingsRecord {
    pub id: Uuid,
    pub chat_id: Option<String>,
    pub message_id: Option<String>,
    pub tokens: u64,
    pub created_at: DateTime<Utc>,
}

impl InputTokenSavingsRecord {
    pub fn new(chat_id: Option<String>, message_id: Option<String>, tokens: u64) -> Self {
        InputTokenSavingsRecord {
            id: Uuid::now_v7(),
            chat_id,
            message_id,
            tokens,
            created_at: Utc::now(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    #[default]
    Private,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Chat {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub visibility: Visibility,
    pub created_at: DateTime<Utc>,
}

impl Chat {
    pub fn new(id: impl Into<String>, user_id: impl Into<String>, title: impl Into<String>) -> Self {
        Chat {
            id: id.into(),
            user_id: user_id.into(),
            title: title.into(),
            visibility: Visibility::default(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub chat_id: String,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(
        id: impl Into<String>,
        chat_id: impl Into<String>,
        role: Role,
        content: impl Into<String>,
    ) -> Self {
        ChatMessage {
            id: id.into(),
            chat_id: chat_id.into(),
            role,
            content: content.into(),
            created_at: Utc::now(),
        }
    }
}

/// Aggregates over all token usage records.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TokenUsageStats {
    pub total_prompt_tokens: u64,
    pub total_completion_tokens: u64,
    pub total_tokens: u64,
    pub total_cost: Decimal,
    pub average_tokens_per_invoice: Option<Decimal>,
    pub average_cost_per_invoice: Option<Decimal>,
    pub invoice_count: usize,
}

impl TokenUsageStats {
    /// Averages are per usage record; `invoice_count` counts distinct
    /// invoice ids still attached.
    pub fn from_records(records: &[TokenUsageRecord]) -> Self {
        let mut stats = TokenUsageStats::default();
        let mut invoices = HashSet::new();
        for record in records {
            stats.total_prompt_tokens += record.prompt_tokens;
            stats.total_completion_tokens += record.completion_tokens;
            stats.total_tokens += record.total_tokens;
            stats.total_cost += record_cost(record);
            if let Some(id) = record.invoice_id {
                invoices.insert(id);
            }
        }
        stats.invoice_count = invoices.len();

        if !records.is_empty() {
            let n = Decimal::from(records.len());
            stats.average_tokens_per_invoice = Some(Decimal::from(stats.total_tokens) / n);
            stats.average_cost_per_invoice = Some(stats.total_cost / n);
        }
        stats
    }
}

/// Token usage for one calendar month (`YYYY-MM`).
#[derive(Clone, Debug, PartialEq)]
pub struct MonthlyUsage {
    pub month: String,
    pub total_tokens: u64,
    pub total_cost: Decimal,
    pub invoice_count: usize,
    pub average_cost_per_invoice: Decimal,
}

impl MonthlyUsage {
    /// Group records by the UTC month of `created_at`, oldest month first.
    pub fn from_records(records: &[TokenUsageRecord]) -> Vec<MonthlyUsage> {
        let mut months: BTreeMap<String, Vec<&TokenUsageRecord>> = BTreeMap::new();
        for record in records {
            months
                .entry(record.created_at.format("%Y-%m").to_string())
                .or_default()
                .push(record);
        }

        months
            .into_iter()
            .map(|(month, group)| {
                let total_cost: Decimal = group.iter().map(|r| record_cost(r)).sum();
                let invoices: HashSet<Uuid> = group.iter().filter_map(|r| r.invoice_id).collect();
                MonthlyUsage {
                    month,
                    total_tokens: group.iter().map(|r| r.total_tokens).sum(),
                    total_cost,
                    invoice_count: invoices.len(),
                    average_cost_per_invoice: total_cost / Decimal::from(group.len()),
                }
            })
            .collect()
    }
}

fn record_cost(record: &TokenUsageRecord) -> Decimal {
    Decimal::from_str(&record.cost).unwrap_or_else(|_| {
        warn!("Usage record {} has unparsable cost '{}'", record.id, record.cost);
        Decimal::ZERO
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn test_line_item_consistency() {
        let mut item = LineItem::new(Uuid::now_v7(), "Consulting");
        item.quantity = Some(dec("10"));
        item.unit_price = Some(dec("100.00"));
        item.total = Some(dec("1000.00"));
        assert!(item.is_consistent());

        item.total = Some(dec("999.995"));
        assert!(item.is_consistent());

        item.total = Some(dec("900"));
        assert!(!item.is_consistent());
    }

    #[test]
    fn test_partial_line_item_is_not_flagged() {
        let mut item = LineItem::new(Uuid::now_v7(), "License");
        item.total = Some(dec("500"));
        assert!(item.is_consistent());
        assert_eq!(item.expected_total(), None);
    }

    #[test]
    fn test_low_confidence() {
        let mut invoice = Invoice::new();
        assert!(invoice.is_low_confidence());
        invoice.customer_name = Some("A".to_string());
        invoice.vendor_name = Some("B".to_string());
        invoice.invoice_number = Some("1".to_string());
        assert!(!invoice.is_low_confidence());
    }

    #[test]
    fn test_usage_record_total_is_sum() {
        let cost = Cost {
            amount: dec("0.0125"),
            priced_as: "gpt-4o".to_string(),
            estimated: false,
        };
        let record = TokenUsageRecord::new(None, Usage::new(1000, 500), &cost);
        assert_eq!(record.total_tokens, 1500);
        assert_eq!(record.cost, "0.0125");
    }

    #[test]
    fn test_line_items_total() {
        let mut invoice = Invoice::new();
        let mut a = LineItem::new(invoice.id, "a");
        a.total = Some(dec("1000"));
        let mut b = LineItem::new(invoice.id, "b");
        b.total = Some(dec("500"));
        invoice.line_items = vec![a, b];
        assert_eq!(invoice.line_items_total(), Some(dec("1500")));
    }

    fn usage_at(invoice_id: Option<Uuid>, tokens: u64, cost: &str, month: u32) -> TokenUsageRecord {
        let cost = Cost {
            amount: dec(cost),
            priced_as: "gpt-4o".to_string(),
            estimated: false,
        };
        let mut record = TokenUsageRecord::new(invoice_id, Usage::new(tokens, 0), &cost);
        record.created_at = Utc.with_ymd_and_hms(2024, month, 15, 12, 0, 0).unwrap();
        record
    }

    #[test]
    fn test_usage_stats() {
        let invoice = Uuid::now_v7();
        let records = vec![
            usage_at(Some(invoice), 100, "0.01", 1),
            usage_at(Some(invoice), 300, "0.03", 1),
            usage_at(None, 200, "0.02", 2),
        ];
        let stats = TokenUsageStats::from_records(&records);
        assert_eq!(stats.total_tokens, 600);
        assert_eq!(stats.total_cost, dec("0.06"));
        assert_eq!(stats.invoice_count, 1);
        assert_eq!(stats.average_tokens_per_invoice, Some(dec("200")));
        assert_eq!(stats.average_cost_per_invoice, Some(dec("0.02")));

        assert_eq!(TokenUsageStats::from_records(&[]).average_cost_per_invoice, None);
    }

    #[test]
    fn test_monthly_usage_sorted_by_month() {
        let records = vec![
            usage_at(None, 200, "0.02", 3),
            usage_at(Some(Uuid::now_v7()), 100, "0.01", 1),
            usage_at(Some(Uuid::now_v7()), 100, "0.03", 1),
        ];
        let months = MonthlyUsage::from_records(&records);
        assert_eq!(months.len(), 2);
        assert_eq!(months[0].month, "2024-01");
        assert_eq!(months[0].total_tokens, 200);
        assert_eq!(months[0].invoice_count, 2);
        assert_eq!(months[0].average_cost_per_invoice, dec("0.02"));
        assert_eq!(months[1].month, "2024-03");
    }
}
