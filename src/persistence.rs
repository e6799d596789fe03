//! Persistence gateway contract.
//!
//! The `PersistenceGateway` trait decouples the pipeline from the durable
//! store holding chats, messages, invoices, line items, and usage and
//! savings records. The crate never embeds query logic; aggregation helpers
//! live on the record types in [`crate::model`] so any implementation can
//! reuse them.
//!
//! # Error Handling
//!
//! Implementations return `Error::PersistenceError` for store failures.
//! Callers in this crate log those failures and move on; a write is never
//! retried and never undoes sibling writes that already succeeded.

use crate::edit::{InvoiceEdit, LineItemEdit};
use crate::error::{Error, Result};
use crate::model::{
    Chat, ChatMessage, InputTokenSavingsRecord, Invoice, LineItem, MonthlyUsage,
    TokenUsageRecord, TokenUsageStats,
};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

/// Durable store used by the chat service and the accounting pipeline.
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    async fn save_chat(&self, chat: Chat) -> Result<()>;

    async fn get_chat_by_id(&self, id: &str) -> Result<Option<Chat>>;

    async fn save_messages(&self, messages: Vec<ChatMessage>) -> Result<()>;

    async fn get_messages_by_chat_id(&self, chat_id: &str) -> Result<Vec<ChatMessage>>;

    /// Store an invoice header. Line items on `invoice` are ignored.
    async fn create_invoice(&self, invoice: &Invoice) -> Result<()>;

    async fn create_invoice_line_items(&self, items: Vec<LineItem>) -> Result<()>;

    /// Invoice with its line items in document order.
    async fn get_invoice_by_id(&self, id: Uuid) -> Result<Option<Invoice>>;

    async fn get_all_invoices(&self) -> Result<Vec<Invoice>>;

    async fn update_invoice(&self, id: Uuid, edit: &InvoiceEdit) -> Result<Invoice>;

    async fn update_invoice_line_item(
        &self,
        invoice_id: Uuid,
        line_item_id: Uuid,
        edit: &LineItemEdit,
    ) -> Result<LineItem>;

    /// Remove an invoice and its line items. Usage records survive with
    /// `invoice_id` set to `None`. Returns `false` if nothing was deleted.
    async fn delete_invoice(&self, id: Uuid) -> Result<bool>;

    async fn save_token_usage(&self, record: TokenUsageRecord) -> Result<()>;

    async fn get_token_usage_by_invoice_id(&self, invoice_id: Uuid) -> Result<Vec<TokenUsageRecord>>;

    /// Mean cost over all usage records, `None` when there are none.
    async fn get_average_invoice_cost(&self) -> Result<Option<Decimal>>;

    async fn get_token_usage_stats(&self) -> Result<TokenUsageStats>;

    async fn get_monthly_token_usage_stats(&self) -> Result<Vec<MonthlyUsage>>;

    async fn save_input_tokens(&self, record: InputTokenSavingsRecord) -> Result<()>;

    async fn get_total_input_tokens(&self) -> Result<u64>;

    async fn get_input_tokens_by_chat_id(&self, chat_id: &str) -> Result<u64>;
}

// ============================================================================
// In-Memory Test Gateway
// ============================================================================

/// Operations that can be made to fail in [`InMemoryGateway`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GatewayOp {
    SaveChat,
    SaveMessages,
    CreateInvoice,
    CreateLineItems,
    SaveTokenUsage,
    SaveInputTokens,
}

#[derive(Default)]
struct State {
    chats: HashMap<String, Chat>,
    messages: Vec<ChatMessage>,
    invoices: Vec<Invoice>,
    line_items: Vec<LineItem>,
    usage: Vec<TokenUsageRecord>,
    savings: Vec<InputTokenSavingsRecord>,
}

/// In-memory gateway for tests and local runs.
///
/// Keeps everything in insertion order behind a mutex. Individual operations
/// can be switched to fail with [`InMemoryGateway::fail_on`] to exercise the
/// partial-failure paths.
#[derive(Default)]
pub struct InMemoryGateway {
    state: Mutex<State>,
    failing: Mutex<HashSet<GatewayOp>>,
}

impl InMemoryGateway {
    pub fn new() -> Self {
        InMemoryGateway::default()
    }

    /// Make `op` return `Error::PersistenceError` until cleared.
    pub fn fail_on(&self, op: GatewayOp) {
        lock(&self.failing).insert(op);
    }

    pub fn clear_failures(&self) {
        lock(&self.failing).clear();
    }

    pub fn usage_records(&self) -> Vec<TokenUsageRecord> {
        lock(&self.state).usage.clone()
    }

    pub fn savings_records(&self) -> Vec<InputTokenSavingsRecord> {
        lock(&self.state).savings.clone()
    }

    pub fn invoice_count(&self) -> usize {
        lock(&self.state).invoices.len()
    }

    fn check(&self, op: GatewayOp) -> Result<()> {
        if lock(&self.failing).contains(&op) {
            return Err(Error::PersistenceError(format!("{:?} failed (injected)", op)));
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn assemble(state: &State, header: &Invoice) -> Invoice {
    let mut invoice = header.clone();
    invoice.line_items = state
        .line_items
        .iter()
        .filter(|item| item.invoice_id == header.id)
        .cloned()
        .collect();
    invoice
}

fn not_found(what: &str, id: Uuid) -> Error {
    Error::PersistenceError(format!("{} {} not found", what, id))
}

#[async_trait]
impl PersistenceGateway for InMemoryGateway {
    async fn save_chat(&self, chat: Chat) -> Result<()> {
        self.check(GatewayOp::SaveChat)?;
        lock(&self.state).chats.insert(chat.id.clone(), chat);
        Ok(())
    }

    async fn get_chat_by_id(&self, id: &str) -> Result<Option<Chat>> {
        Ok(lock(&self.state).chats.get(id).cloned())
    }

    async fn save_messages(&self, messages: Vec<ChatMessage>) -> Result<()> {
        self.check(GatewayOp::SaveMessages)?;
        lock(&self.state).messages.extend(messages);
        Ok(())
    }

    async fn get_messages_by_chat_id(&self, chat_id: &str) -> Result<Vec<ChatMessage>> {
        Ok(lock(&self.state)
            .messages
            .iter()
            .filter(|m| m.chat_id == chat_id)
            .cloned()
            .collect())
    }

    async fn create_invoice(&self, invoice: &Invoice) -> Result<()> {
        self.check(GatewayOp::CreateInvoice)?;
        let mut state = lock(&self.state);
        if state.invoices.iter().any(|i| i.id == invoice.id) {
            return Err(Error::PersistenceError(format!(
                "invoice {} already exists",
                invoice.id
            )));
        }
        state.invoices.push(invoice.header());
        Ok(())
    }

    async fn create_invoice_line_items(&self, items: Vec<LineItem>) -> Result<()> {
        self.check(GatewayOp::CreateLineItems)?;
        let mut state = lock(&self.state);
        if let Some(orphan) = items
            .iter()
            .find(|item| !state.invoices.iter().any(|i| i.id == item.invoice_id))
        {
            return Err(not_found("invoice", orphan.invoice_id));
        }
        state.line_items.extend(items);
        Ok(())
    }

    async fn get_invoice_by_id(&self, id: Uuid) -> Result<Option<Invoice>> {
        let state = lock(&self.state);
        Ok(state
            .invoices
            .iter()
            .find(|i| i.id == id)
            .map(|header| assemble(&state, header)))
    }

    async fn get_all_invoices(&self) -> Result<Vec<Invoice>> {
        let state = lock(&self.state);
        Ok(state
            .invoices
            .iter()
            .map(|header| assemble(&state, header))
            .collect())
    }

    async fn update_invoice(&self, id: Uuid, edit: &InvoiceEdit) -> Result<Invoice> {
        let mut state = lock(&self.state);
        let header = state
            .invoices
            .iter_mut()
            .find(|i| i.id == id)
            .ok_or_else(|| not_found("invoice", id))?;
        edit.apply(header);
        let header = header.clone();
        Ok(assemble(&state, &header))
    }

    async fn update_invoice_line_item(
        &self,
        invoice_id: Uuid,
        line_item_id: Uuid,
        edit: &LineItemEdit,
    ) -> Result<LineItem> {
        let mut state = lock(&self.state);
        let item = state
            .line_items
            .iter_mut()
            .find(|item| item.id == line_item_id && item.invoice_id == invoice_id)
            .ok_or_else(|| not_found("line item", line_item_id))?;
        edit.apply(item);
        Ok(item.clone())
    }

    async fn delete_invoice(&self, id: Uuid) -> Result<bool> {
        let mut state = lock(&self.state);
        let before = state.invoices.len();
        state.invoices.retain(|i| i.id != id);
        if state.invoices.len() == before {
            return Ok(false);
        }
        state.line_items.retain(|item| item.invoice_id != id);
        for record in state.usage.iter_mut().filter(|r| r.invoice_id == Some(id)) {
            record.invoice_id = None;
        }
        Ok(true)
    }

    async fn save_token_usage(&self, record: TokenUsageRecord) -> Result<()> {
        self.check(GatewayOp::SaveTokenUsage)?;
        lock(&self.state).usage.push(record);
        Ok(())
    }

    async fn get_token_usage_by_invoice_id(&self, invoice_id: Uuid) -> Result<Vec<TokenUsageRecord>> {
        Ok(lock(&self.state)
            .usage
            .iter()
            .filter(|r| r.invoice_id == Some(invoice_id))
            .cloned()
            .collect())
    }

    async fn get_average_invoice_cost(&self) -> Result<Option<Decimal>> {
        Ok(TokenUsageStats::from_records(&lock(&self.state).usage).average_cost_per_invoice)
    }

    async fn get_token_usage_stats(&self) -> Result<TokenUsageStats> {
        Ok(TokenUsageStats::from_records(&lock(&self.state).usage))
    }

    async fn get_monthly_token_usage_stats(&self) -> Result<Vec<MonthlyUsage>> {
        Ok(MonthlyUsage::from_records(&lock(&self.state).usage))
    }

    async fn save_input_tokens(&self, record: InputTokenSavingsRecord) -> Result<()> {
        self.check(GatewayOp::SaveInputTokens)?;
        lock(&self.state).savings.push(record);
        Ok(())
    }

    async fn get_total_input_tokens(&self) -> Result<u64> {
        Ok(lock(&self.state).savings.iter().map(|r| r.tokens).sum())
    }

    async fn get_input_tokens_by_chat_id(&self, chat_id: &str) -> Result<u64> {
        Ok(lock(&self.state)
            .savings
            .iter()
            .filter(|r| r.chat_id.as_deref() == Some(chat_id))
            .map(|r| r.tokens)
            .sum())
    }
}
