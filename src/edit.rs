//! Field-level edits coming from the invoice table.
//!
//! The front end sends `{ field, value }` pairs with string values. Parsing
//! happens here, once, so a bad value is rejected before anything is
//! written: dates must be strict `YYYY-MM-DD`, numbers must be decimals, and
//! unknown field names are refused. Field names are accepted in both the
//! front end's camelCase and the extraction keys' snake_case.

use crate::dates::parse_date;
use crate::error::{Error, Result};
use crate::model::{Invoice, LineItem};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::str::FromStr;

/// A single-field change to an invoice header.
#[derive(Clone, Debug, PartialEq)]
pub enum InvoiceEdit {
    CustomerName(Option<String>),
    VendorName(Option<String>),
    InvoiceNumber(Option<String>),
    InvoiceDate(NaiveDate),
    DueDate(NaiveDate),
    Amount(Option<Decimal>),
}

impl InvoiceEdit {
    /// # Errors
    ///
    /// Returns `Error::ValidationError` for an unknown field, a date that is
    /// not `YYYY-MM-DD`, or an amount that is not a decimal.
    ///
    /// ```
    /// use llm_cache_kit::edit::InvoiceEdit;
    ///
    /// assert!(InvoiceEdit::parse("dueDate", "2024-02-01").is_ok());
    /// assert!(InvoiceEdit::parse("dueDate", "02/01/2024").is_err());
    /// ```
    pub fn parse(field: &str, value: &str) -> Result<Self> {
        let edit = match field {
            "customerName" | "customer_name" => InvoiceEdit::CustomerName(text(value)),
            "vendorName" | "vendor_name" => InvoiceEdit::VendorName(text(value)),
            "invoiceNumber" | "invoice_number" => InvoiceEdit::InvoiceNumber(text(value)),
            "invoiceDate" | "invoice_date" => InvoiceEdit::InvoiceDate(parse_date(field, value)?),
            "dueDate" | "due_date" => InvoiceEdit::DueDate(parse_date(field, value)?),
            "amount" => InvoiceEdit::Amount(number(field, value)?),
            _ => return Err(unknown_field(field)),
        };
        Ok(edit)
    }

    pub fn apply(&self, invoice: &mut Invoice) {
        match self {
            InvoiceEdit::CustomerName(v) => invoice.customer_name = v.clone(),
            InvoiceEdit::VendorName(v) => invoice.vendor_name = v.clone(),
            InvoiceEdit::InvoiceNumber(v) => invoice.invoice_number = v.clone(),
            InvoiceEdit::InvoiceDate(d) => invoice.invoice_date = Some(*d),
            InvoiceEdit::DueDate(d) => invoice.due_date = Some(*d),
            InvoiceEdit::Amount(v) => invoice.amount = *v,
        }
    }
}

/// A single-field change to a line item.
#[derive(Clone, Debug, PartialEq)]
pub enum LineItemEdit {
    Description(String),
    Quantity(Option<Decimal>),
    UnitPrice(Option<Decimal>),
    Total(Option<Decimal>),
}

impl LineItemEdit {
    /// # Errors
    ///
    /// Returns `Error::ValidationError` for an unknown field or a number that
    /// is not a decimal.
    pub fn parse(field: &str, value: &str) -> Result<Self> {
        let edit = match field {
            "description" => LineItemEdit::Description(value.trim().to_string()),
            "quantity" => LineItemEdit::Quantity(number(field, value)?),
            "unitPrice" | "unit_price" => LineItemEdit::UnitPrice(number(field, value)?),
            "total" => LineItemEdit::Total(number(field, value)?),
            _ => return Err(unknown_field(field)),
        };
        Ok(edit)
    }

    pub fn apply(&self, item: &mut LineItem) {
        match self {
            LineItemEdit::Description(v) => item.description = v.clone(),
            LineItemEdit::Quantity(v) => item.quantity = *v,
            LineItemEdit::UnitPrice(v) => item.unit_price = *v,
            LineItemEdit::Total(v) => item.total = *v,
        }
    }
}

fn text(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn number(field: &str, value: &str) -> Result<Option<Decimal>> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    Decimal::from_str(trimmed)
        .map(Some)
        .map_err(|_| Error::validation(field, format!("'{}' is not a decimal number", value)))
}

fn unknown_field(field: &str) -> Error {
    Error::validation(field, "field cannot be edited")
}
