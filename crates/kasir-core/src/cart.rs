//! # Cart
//!
//! The cashier's in-progress basket, before it becomes a [`SaleRequest`].
//!
//! ## Cart Operations Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Cart Operations                                 │
//! │                                                                         │
//! │  Scan product ─────────► add_item()        ──► line qty += n           │
//! │  Change quantity ──────► update_quantity() ──► line qty = n            │
//! │  Remove line ──────────► remove_item()     ──► line dropped            │
//! │  Clear ────────────────► clear()           ──► empty                   │
//! │  Pay ──────────────────► to_sale_request() ──► SaleProcessor           │
//! │                                                                         │
//! │  Every mutation adjusts the running subtotal by the delta it caused,   │
//! │  so totals() never re-walks the lines.                                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::error::{CoreError, CoreResult};
use crate::money::Money;
use crate::types::{
    amount_overflow, LocalProduct, PaymentMethod, SaleLine, SaleRequest, SaleTotals, TaxRate,
};
use crate::validation::validate_quantity;
use crate::{MAX_CART_ITEMS, MAX_ITEM_QUANTITY};

/// An item in the cart. Name and price are frozen when first added.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartItem {
    pub product_id: String,
    pub name: String,
    pub unit_price: Money,
    pub quantity: i64,
    pub added_at: DateTime<Utc>,
}

impl CartItem {
    /// ## Price Freezing
    /// The price is captured at this moment. A pull that changes the cached
    /// price does not reprice a line already in the cart.
    pub fn from_product(product: &LocalProduct, quantity: i64) -> Self {
        CartItem {
            product_id: product.id.clone(),
            name: product.name.clone(),
            unit_price: product.price,
            quantity,
            added_at: Utc::now(),
        }
    }

    pub fn line_total(&self) -> Money {
        self.unit_price * self.quantity
    }
}

/// Totals snapshot handed to the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct CartTotals {
    pub item_count: usize,
    pub total_quantity: i64,
    pub subtotal: Money,
    pub tax: Money,
    pub total: Money,
}

/// The shopping cart.
///
/// ## Invariants
/// - Items are unique by `product_id` (adding same product increases quantity)
/// - Every quantity is in `1..=MAX_ITEM_QUANTITY`
/// - At most `MAX_CART_ITEMS` lines
/// - `subtotal == Σ line_total()` after every operation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cart {
    items: Vec<CartItem>,
    subtotal: Money,
    tax_rate: TaxRate,
    pub created_at: DateTime<Utc>,
}

impl Default for Cart {
    fn default() -> Self {
        Cart::new(TaxRate::zero())
    }
}

impl Cart {
    pub fn new(tax_rate: TaxRate) -> Self {
        Cart {
            items: Vec::new(),
            subtotal: Money::zero(),
            tax_rate,
            created_at: Utc::now(),
        }
    }

    pub fn items(&self) -> &[CartItem] {
        &self.items
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Adds a product to the cart or increases quantity if already present.
    pub fn add_item(&mut self, product: &LocalProduct, quantity: i64) -> CoreResult<()> {
        check_quantity(quantity)?;
        if !product.is_active {
            return Err(CoreError::ProductInactive(product.id.clone()));
        }

        if let Some(item) = self.items.iter_mut().find(|i| i.product_id == product.id) {
            let new_qty = item.quantity + quantity;
            if new_qty > MAX_ITEM_QUANTITY {
                return Err(CoreError::QuantityTooLarge {
                    requested: new_qty,
                    max: MAX_ITEM_QUANTITY,
                });
            }
            let subtotal = grow(self.subtotal, item.unit_price, quantity)?;
            item.quantity = new_qty;
            self.subtotal = subtotal;
            return Ok(());
        }

        if self.items.len() >= MAX_CART_ITEMS {
            return Err(CoreError::CartTooLarge {
                max: MAX_CART_ITEMS,
            });
        }

        let item = CartItem::from_product(product, quantity);
        self.subtotal = grow(self.subtotal, item.unit_price, quantity)?;
        self.items.push(item);
        Ok(())
    }

    /// Sets the quantity of a line. Zero removes it.
    pub fn update_quantity(&mut self, product_id: &str, quantity: i64) -> CoreResult<()> {
        if quantity == 0 {
            return self.remove_item(product_id);
        }
        check_quantity(quantity)?;

        let item = self
            .items
            .iter_mut()
            .find(|i| i.product_id == product_id)
            .ok_or_else(|| CoreError::NotInCart(product_id.to_string()))?;
        let subtotal = grow(self.subtotal, item.unit_price, quantity - item.quantity)?;
        item.quantity = quantity;
        self.subtotal = subtotal;
        Ok(())
    }

    pub fn remove_item(&mut self, product_id: &str) -> CoreResult<()> {
        let pos = self
            .items
            .iter()
            .position(|i| i.product_id == product_id)
            .ok_or_else(|| CoreError::NotInCart(product_id.to_string()))?;
        let removed = self.items.remove(pos);
        self.subtotal -= removed.line_total();
        Ok(())
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.subtotal = Money::zero();
        self.created_at = Utc::now();
    }

    pub fn subtotal(&self) -> Money {
        self.subtotal
    }

    pub fn tax(&self) -> Money {
        self.subtotal.calculate_tax(self.tax_rate)
    }

    pub fn total(&self) -> CoreResult<Money> {
        Ok(self.totals()?.total)
    }

    pub fn totals(&self) -> CoreResult<CartTotals> {
        let SaleTotals {
            subtotal,
            tax,
            total,
        } = SaleTotals::from_subtotal(self.subtotal, self.tax_rate)?;
        Ok(CartTotals {
            item_count: self.items.len(),
            total_quantity: self.items.iter().map(|i| i.quantity).sum(),
            subtotal,
            tax,
            total,
        })
    }

    /// Converts the cart into the sale processor's input.
    pub fn to_sale_request(&self, payment_method: PaymentMethod, amount_paid: Money) -> SaleRequest {
        SaleRequest {
            items: self
                .items
                .iter()
                .map(|i| SaleLine {
                    product_id: i.product_id.clone(),
                    quantity: i.quantity,
                })
                .collect(),
            payment_method,
            amount_paid,
        }
    }
}

fn check_quantity(quantity: i64) -> CoreResult<()> {
    if quantity > MAX_ITEM_QUANTITY {
        return Err(CoreError::QuantityTooLarge {
            requested: quantity,
            max: MAX_ITEM_QUANTITY,
        });
    }
    validate_quantity(quantity)?;
    Ok(())
}

/// `subtotal + unit_price * delta`, or an error when it leaves `i64`.
fn grow(subtotal: Money, unit_price: Money, delta: i64) -> CoreResult<Money> {
    unit_price
        .checked_mul(delta)
        .and_then(|change| subtotal.checked_add(change))
        .ok_or_else(|| amount_overflow("subtotal").into())
}
