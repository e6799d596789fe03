//! Invoice extraction from free-form model output.
//!
//! Model answers usually carry one JSON object, sometimes wrapped in prose or
//! a fenced code block. [`find_json_object`] locates the first balanced
//! top-level object without being fooled by braces inside string literals;
//! [`InvoiceExtractor`] maps it onto [`Invoice`] and [`LineItem`].
//!
//! Field-level problems never fail the whole extraction. A date that is not
//! `YYYY-MM-DD` or a number that is not a decimal is nulled and reported as a
//! [`FieldIssue`], so the remaining fields are kept.

use crate::dates::parse_date;
use crate::error::{Error, Result};
use crate::model::{Invoice, LineItem};
use rust_decimal::Decimal;
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Locate the first balanced top-level JSON object in `text`.
///
/// Scanning starts at the first `{`. Braces inside string literals (with
/// backslash escapes honoured) do not count.
///
/// ```
/// use llm_cache_kit::extract::find_json_object;
///
/// let text = r#"Result: {"a": "}{", "b": {"c": 1}} trailing"#;
/// assert_eq!(find_json_object(text), Some(r#"{"a": "}{", "b": {"c": 1}}"#));
/// assert_eq!(find_json_object("{ never closed"), None);
/// ```
pub fn find_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }

        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    let end = start + offset + ch.len_utf8();
                    return Some(&text[start..end]);
                }
            }
            _ => {}
        }
    }

    None
}

/// A field that was present but could not be used.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldIssue {
    /// Date not in strict `YYYY-MM-DD` form; the field was nulled.
    InvalidDate { field: String, value: String },
    /// Value is not a decimal number; the field was nulled.
    InvalidNumber { field: String, value: String },
    /// Value has the wrong JSON type for a text field; the field was nulled.
    InvalidText { field: String },
    /// `quantity × unit_price` differs from `total` by more than 0.01.
    /// Values are kept as extracted.
    TotalMismatch {
        line: usize,
        expected: Decimal,
        total: Decimal,
    },
}

impl fmt::Display for FieldIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldIssue::InvalidDate { field, value } => {
                write!(f, "{}: '{}' is not a YYYY-MM-DD date", field, value)
            }
            FieldIssue::InvalidNumber { field, value } => {
                write!(f, "{}: '{}' is not a number", field, value)
            }
            FieldIssue::InvalidText { field } => write!(f, "{}: expected a string", field),
            FieldIssue::TotalMismatch {
                line,
                expected,
                total,
            } => write!(
                f,
                "line_items[{}]: quantity x unit_price = {} but total = {}",
                line, expected, total
            ),
        }
    }
}

/// Result of a successful extraction.
#[derive(Clone, Debug, PartialEq)]
pub struct Extraction {
    pub invoice: Invoice,
    pub issues: Vec<FieldIssue>,
}

impl Extraction {
    pub fn is_low_confidence(&self) -> bool {
        self.invoice.is_low_confidence()
    }

    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Parses model output into an [`Invoice`].
#[derive(Clone, Copy, Debug, Default)]
pub struct InvoiceExtractor;

impl InvoiceExtractor {
    pub fn new() -> Self {
        InvoiceExtractor
    }

    /// # Errors
    ///
    /// Returns `Error::ExtractionError` if no balanced object is found, the
    /// object is not valid JSON, or `line_items` is present but not an array.
    pub fn extract(&self, text: &str) -> Result<Extraction> {
        let json = find_json_object(text)
            .ok_or_else(|| Error::ExtractionError("no balanced JSON object in text".to_string()))?;

        let value: Value = serde_json::from_str(json)
            .map_err(|e| Error::ExtractionError(format!("invalid JSON object: {}", e)))?;
        let Value::Object(fields) = value else {
            return Err(Error::ExtractionError("top-level value is not an object".to_string()));
        };

        let mut mapper = FieldMapper::default();
        let mut invoice = Invoice::new();
        invoice.customer_name = mapper.text(&fields, "customer_name");
        invoice.vendor_name = mapper.text(&fields, "vendor_name");
        invoice.invoice_number = mapper.text(&fields, "invoice_number");
        invoice.invoice_date = mapper.date(&fields, "invoice_date");
        invoice.due_date = mapper.date(&fields, "due_date");
        invoice.amount = mapper.number(&fields, "amount", "amount");

        match fields.get("line_items") {
            None | Some(Value::Null) => {}
            Some(Value::Array(items)) => {
                for (index, item) in items.iter().enumerate() {
                    let Value::Object(item) = item else {
                        return Err(Error::ExtractionError(format!(
                            "line_items[{}] is not an object",
                            index
                        )));
                    };
                    let line = mapper.line_item(invoice.id, index, item);
                    invoice.line_items.push(line);
                }
            }
            Some(_) => {
                return Err(Error::ExtractionError("line_items is not an array".to_string()));
            }
        }

        for issue in &mapper.issues {
            warn!("Invoice {} extracted with issue: {}", invoice.id, issue);
        }

        Ok(Extraction {
            invoice,
            issues: mapper.issues,
        })
    }
}

#[derive(Default)]
struct FieldMapper {
    issues: Vec<FieldIssue>,
}

impl FieldMapper {
    fn text(&mut self, fields: &Map<String, Value>, key: &str) -> Option<String> {
        match fields.get(key)? {
            Value::Null => None,
            Value::String(s) => non_empty(s).map(str::to_string),
            // Invoice numbers are sometimes emitted as bare numbers.
            Value::Number(n) => Some(n.to_string()),
            _ => {
                self.issues.push(FieldIssue::InvalidText {
                    field: key.to_string(),
                });
                None
            }
        }
    }

    fn date(&mut self, fields: &Map<String, Value>, key: &str) -> Option<chrono::NaiveDate> {
        let raw = match fields.get(key)? {
            Value::Null => return None,
            Value::String(s) => match non_empty(s) {
                Some(s) => s.to_string(),
                None => return None,
            },
            other => other.to_string(),
        };

        match parse_date(key, &raw) {
            Ok(date) => Some(date),
            Err(_) => {
                self.issues.push(FieldIssue::InvalidDate {
                    field: key.to_string(),
                    value: raw,
                });
                None
            }
        }
    }

    /// `label` names the field in issues; `key` is the JSON key.
    fn number(&mut self, fields: &Map<String, Value>, key: &str, label: &str) -> Option<Decimal> {
        let value = fields.get(key)?;
        let raw = match value {
            Value::Null => return None,
            Value::String(s) => match non_empty(s) {
                Some(s) => s.to_string(),
                None => return None,
            },
            Value::Number(n) => n.to_string(),
            other => other.to_string(),
        };

        match parse_decimal(&raw) {
            Some(number) => Some(number),
            None => {
                self.issues.push(FieldIssue::InvalidNumber {
                    field: label.to_string(),
                    value: raw,
                });
                None
            }
        }
    }

    fn line_item(
        &mut self,
        invoice_id: uuid::Uuid,
        index: usize,
        fields: &Map<String, Value>,
    ) -> LineItem {
        let label = |key: &str| format!("line_items[{}].{}", index, key);

        let description = match fields.get("description") {
            Some(Value::String(s)) => s.trim().to_string(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        };

        let mut item = LineItem::new(invoice_id, description);
        item.quantity = self.number(fields, "quantity", &label("quantity"));
        item.unit_price = self.number(fields, "unit_price", &label("unit_price"));
        item.total = self.number(fields, "total", &label("total"));

        if !item.is_consistent() {
            if let (Some(expected), Some(total)) = (item.expected_total(), item.total) {
                self.issues.push(FieldIssue::TotalMismatch {
                    line: index,
                    expected,
                    total,
                });
            }
        }

        item
    }
}

fn non_empty(s: &str) -> Option<&str> {
    let trimmed = s.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}

fn parse_decimal(raw: &str) -> Option<Decimal> {
    let cleaned: String = raw.trim().chars().filter(|c| *c != ',').collect();
    Decimal::from_str(&cleaned)
        .or_else(|_| Decimal::from_scientific(&cleaned))
        .ok()
}
