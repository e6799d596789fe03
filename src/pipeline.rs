//! Turns a finished model response into persisted invoice and usage records.
//!
//! Order of work for one turn:
//!
//! 1. Price the turn's usage.
//! 2. Extract the invoice from the response text. A turn with no invoice
//!    stops here and writes nothing.
//! 3. Write the invoice header, then its line items.
//! 4. Write the token usage record, linked to the invoice when the header
//!    was written.
//!
//! Nothing here returns an error to the chat. Every failure is logged and
//! collected in the [`PipelineReport`]; writes that already succeeded stay.

use crate::error::Error;
use crate::extract::{FieldIssue, InvoiceExtractor};
use crate::model::TokenUsageRecord;
use crate::persistence::PersistenceGateway;
use crate::pricing::{Cost, UsageAccountant};
use crate::request::{ModelResponse, Usage};
use std::sync::Arc;
use uuid::Uuid;

/// What a completed chat turn hands to the pipeline.
#[derive(Clone, Debug, PartialEq)]
pub struct TurnOutput {
    pub model_id: String,
    pub text: String,
    pub usage: Usage,
}

impl TurnOutput {
    pub fn new(model_id: impl Into<String>, response: &ModelResponse) -> Self {
        TurnOutput {
            model_id: model_id.into(),
            text: response.text.clone(),
            usage: response.usage,
        }
    }
}

/// Outcome of one pipeline run.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PipelineReport {
    /// Set when the invoice header was written.
    pub invoice_id: Option<Uuid>,
    pub line_items_saved: usize,
    pub low_confidence: bool,
    pub issues: Vec<FieldIssue>,
    /// The usage record, if it was written.
    pub usage: Option<TokenUsageRecord>,
    pub errors: Vec<Error>,
}

impl PipelineReport {
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty() && self.invoice_id.is_some() && self.usage.is_some()
    }
}

/// Extraction, costing and persistence for completed turns.
pub struct AccountingPipeline {
    extractor: InvoiceExtractor,
    accountant: UsageAccountant,
    gateway: Arc<dyn PersistenceGateway>,
}

impl AccountingPipeline {
    pub fn new(accountant: UsageAccountant, gateway: Arc<dyn PersistenceGateway>) -> Self {
        AccountingPipeline {
            extractor: InvoiceExtractor::new(),
            accountant,
            gateway,
        }
    }

    pub fn gateway(&self) -> &Arc<dyn PersistenceGateway> {
        &self.gateway
    }

    pub async fn process(&self, turn: TurnOutput) -> PipelineReport {
        let mut report = PipelineReport::default();

        let cost = match self.accountant.cost_for_usage(turn.usage, &turn.model_id) {
            Ok(cost) => Some(cost),
            Err(e) => {
                error!("Cannot price turn for model '{}': {}", turn.model_id, e);
                report.errors.push(e);
                None
            }
        };

        let extraction = match self.extractor.extract(&turn.text) {
            Ok(extraction) => extraction,
            Err(e) => {
                // No invoice, nothing to account against.
                warn!("No invoice extracted from turn: {}", e);
                report.errors.push(e);
                return report;
            }
        };

        report.low_confidence = extraction.is_low_confidence();
        report.issues = extraction.issues;
        let invoice = extraction.invoice;

        match self.gateway.create_invoice(&invoice).await {
            Ok(()) => {
                report.invoice_id = Some(invoice.id);
                let count = invoice.line_items.len();
                if count > 0 {
                    match self.gateway.create_invoice_line_items(invoice.line_items).await {
                        Ok(()) => report.line_items_saved = count,
                        Err(e) => {
                            error!("Failed to save line items for invoice {}: {}", invoice.id, e);
                            report.errors.push(e);
                        }
                    }
                }
            }
            Err(e) => {
                error!("Failed to save invoice {}: {}", invoice.id, e);
                report.errors.push(e);
            }
        }

        if let Some(cost) = cost {
            self.record_usage(&mut report, turn.usage, &cost).await;
        }

        report
    }

    /// Usage is linked to the invoice when the header was written, else `None`.
    async fn record_usage(&self, report: &mut PipelineReport, usage: Usage, cost: &Cost) {
        let record = TokenUsageRecord::new(report.invoice_id, usage, cost);
        match self.gateway.save_token_usage(record.clone()).await {
            Ok(()) => {
                info!(
                    "Processed invoice {} using {} tokens at a cost of {}",
                    report
                        .invoice_id
                        .map_or_else(|| "-".to_string(), |id| id.to_string()),
                    record.total_tokens,
                    cost
                );
                report.usage = Some(record);
            }
            Err(e) => {
                error!("Failed to save token usage: {}", e);
                report.errors.push(e);
            }
        }
    }
}
