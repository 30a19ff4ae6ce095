//! # Validation Module
//!
//! Shape checks on sale input, run before any product lookup.
//!
//! ## Validation Layers
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Layer 1: THIS MODULE - request shape (non-empty, positive quantities) │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 2: Sale processor - cached product state (exists, active,       │
//! │           stock, payment)                                              │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 3: SQLite - NOT NULL, UNIQUE, CHECK, foreign keys               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use crate::error::ValidationError;
use crate::types::SaleRequest;
use crate::{MAX_CART_ITEMS, MAX_ITEM_QUANTITY};

pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validates a line quantity.
///
/// ## Example
/// ```rust
/// use kasir_core::validation::validate_quantity;
///
/// assert!(validate_quantity(3).is_ok());
/// assert!(validate_quantity(0).is_err());
/// ```
pub fn validate_quantity(quantity: i64) -> ValidationResult<()> {
    if quantity <= 0 {
        return Err(ValidationError::MustBePositive {
            field: "quantity".to_string(),
        });
    }
    if quantity > MAX_ITEM_QUANTITY {
        return Err(ValidationError::OutOfRange {
            field: "quantity".to_string(),
            min: 1,
            max: MAX_ITEM_QUANTITY,
        });
    }
    Ok(())
}

/// Validates an entity id coming from the UI or the wire.
pub fn validate_id(field: &str, id: &str) -> ValidationResult<()> {
    if id.trim().is_empty() {
        return Err(ValidationError::Required {
            field: field.to_string(),
        });
    }
    if id.len() > 64 {
        return Err(ValidationError::TooLong {
            field: field.to_string(),
            max: 64,
        });
    }
    Ok(())
}

/// Validates the shape of a sale request.
///
/// ## Rules
/// - at least one line, at most `MAX_CART_ITEMS`
/// - every product id is present
/// - every quantity is in `1..=MAX_ITEM_QUANTITY`
/// - amount paid is not negative
pub fn validate_sale_request(request: &SaleRequest) -> ValidationResult<()> {
    if request.items.is_empty() {
        return Err(ValidationError::Required {
            field: "items".to_string(),
        });
    }
    if request.items.len() > MAX_CART_ITEMS {
        return Err(ValidationError::OutOfRange {
            field: "items".to_string(),
            min: 1,
            max: MAX_CART_ITEMS as i64,
        });
    }
    for line in &request.items {
        validate_id("product_id", &line.product_id)?;
        validate_quantity(line.quantity)?;
    }
    if request.amount_paid.is_negative() {
        return Err(ValidationError::OutOfRange {
            field: "amount_paid".to_string(),
            min: 0,
            max: i64::MAX,
        });
    }
    Ok(())
}
