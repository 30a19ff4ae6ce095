//! # Invoice Numbers
//!
//! Human-readable sale identifiers of the form `INV-YYYYMMDD-NNNN`.
//!
//! ```text
//! INV-20250301-0042
//! ─┬─ ────┬─── ──┬─
//!  │      │      └── 1-based sequence within the day, zero padded to 4
//!  │      └───────── local calendar date of the sale
//!  └──────────────── fixed prefix
//! ```
//!
//! The register numbers its own sales (highest local sequence for the day
//! plus one). Two registers can therefore hand out the same number on the
//! same day; the server assigns the canonical number when it confirms the
//! sale and the local one is kept unchanged.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{CoreError, ValidationError};

const PREFIX: &str = "INV";

/// Highest sequence expressible in four digits.
pub const MAX_SEQUENCE: u32 = 9999;

/// A parsed, valid invoice number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct InvoiceNumber {
    date: NaiveDate,
    sequence: u32,
}

impl InvoiceNumber {
    /// Builds an invoice number, rejecting sequences outside `1..=9999`.
    pub fn new(date: NaiveDate, sequence: u32) -> Result<Self, CoreError> {
        if sequence == 0 {
            return Err(ValidationError::OutOfRange {
                field: "invoice sequence".to_string(),
                min: 1,
                max: MAX_SEQUENCE as i64,
            }
            .into());
        }
        if sequence > MAX_SEQUENCE {
            return Err(CoreError::InvoiceSequenceExhausted {
                date: date.format("%Y%m%d").to_string(),
            });
        }
        Ok(InvoiceNumber { date, sequence })
    }

    /// The number that follows `last` on `date`.
    ///
    /// `last` is the highest invoice already issued for that date, if any.
    /// Invoices from another date are ignored and the sequence restarts at 1.
    pub fn next_after(date: NaiveDate, last: Option<&InvoiceNumber>) -> Result<Self, CoreError> {
        let seq = match last {
            Some(prev) if prev.date == date => prev.sequence + 1,
            _ => 1,
        };
        Self::new(date, seq)
    }

    /// `INV-YYYYMMDD-`, for prefix lookups in storage.
    pub fn day_prefix(date: NaiveDate) -> String {
        format!("{}-{}-", PREFIX, date.format("%Y%m%d"))
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }
}

impl fmt::Display for InvoiceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{:04}",
            PREFIX,
            self.date.format("%Y%m%d"),
            self.sequence
        )
    }
}

impl FromStr for InvoiceNumber {
    type Err = ValidationError;

    /// ## Rules
    /// - exactly three `-` separated segments
    /// - first segment is `INV`
    /// - second segment is a real `YYYYMMDD` date
    /// - third segment is exactly four ASCII digits, not `0000`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ValidationError::InvalidFormat {
            field: "invoice_number".to_string(),
            reason: reason.to_string(),
        };

        let parts: Vec<&str> = s.split('-').collect();
        if parts.len() != 3 {
            return Err(invalid("expected INV-YYYYMMDD-NNNN"));
        }
        if parts[0] != PREFIX {
            return Err(invalid("must start with INV"));
        }
        if parts[1].len() != 8 || !parts[1].bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid("date segment must be YYYYMMDD"));
        }
        let date = NaiveDate::parse_from_str(parts[1], "%Y%m%d")
            .map_err(|_| invalid("date segment is not a calendar date"))?;
        if parts[2].len() != 4 || !parts[2].bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid("sequence must be four digits"));
        }
        let sequence: u32 = parts[2]
            .parse()
            .map_err(|_| invalid("sequence must be four digits"))?;
        if sequence == 0 {
            return Err(invalid("sequence starts at 0001"));
        }

        Ok(InvoiceNumber { date, sequence })
    }
}

impl TryFrom<String> for InvoiceNumber {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<InvoiceNumber> for String {
    fn from(value: InvoiceNumber) -> Self {
        value.to_string()
    }
}
