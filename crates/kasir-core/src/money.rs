//! # Money Module
//!
//! Provides the `Money` type for handling monetary values safely.
//!
//! ## Why Integer Money?
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  THE FLOATING POINT PROBLEM                                             │
//! │                                                                         │
//! │  Floating point change calculation:                                     │
//! │    30000.10 - 24999.95 = 5000.149999999998  ❌ WRONG!                   │
//! │                                                                         │
//! │  OUR SOLUTION: Integer minor units                                      │
//! │    3000010 - 2499995 = 500015  (exact, always)                          │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Money is currency-agnostic: a "minor unit" is whatever the smallest
//! denomination of the store's currency is. The server speaks the same
//! units over the wire, so no conversion ever happens on the register.
//!
//! ## Usage
//! ```rust
//! use kasir_core::money::Money;
//!
//! let price = Money::from_minor(10_000);
//! let line = price * 2_i64;
//! let total = line + Money::from_minor(5_000);
//! assert_eq!(total.minor(), 25_000);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Mul, Sub, SubAssign};
use ts_rs::TS;

use crate::types::TaxRate;

// =============================================================================
// Money Type
// =============================================================================

/// A monetary value in the smallest currency unit.
///
/// ## Design Decisions
/// - **i64 (signed)**: change can be computed before it is known to be positive
/// - **Single field tuple struct**: Zero-cost abstraction over i64
/// - **Newtype serde**: serializes as a bare integer, matching the API
///
/// ## Where Money Flows
/// ```text
/// LocalProduct.price ──► CartItem.unit_price ──► line subtotal
///                                                     │
///                        Σ subtotal ──► tax ──► total ┘
///                                                │
///                      amount_paid - total ──► change
/// ```
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize, TS,
)]
#[ts(export)]
pub struct Money(i64);

impl Money {
    /// Creates a Money value from minor units.
    ///
    /// ## Example
    /// ```rust
    /// use kasir_core::money::Money;
    ///
    /// let price = Money::from_minor(15_500);
    /// assert_eq!(price.minor(), 15_500);
    /// ```
    #[inline]
    pub const fn from_minor(minor: i64) -> Self {
        Money(minor)
    }

    /// Returns the value in minor units.
    #[inline]
    pub const fn minor(&self) -> i64 {
        self.0
    }

    /// Returns zero money value.
    #[inline]
    pub const fn zero() -> Self {
        Money(0)
    }

    /// Checks if the value is zero.
    #[inline]
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Checks if the value is positive (greater than zero).
    #[inline]
    pub const fn is_positive(&self) -> bool {
        self.0 > 0
    }

    /// Checks if the value is negative (less than zero).
    #[inline]
    pub const fn is_negative(&self) -> bool {
        self.0 < 0
    }

    /// Calculates tax on this amount, rounding half up.
    ///
    /// ## Implementation
    /// Integer math on basis points: `(amount * bps + 5000) / 10000`.
    /// The +5000 provides rounding (5000/10000 = 0.5).
    ///
    /// ## Example
    /// ```rust
    /// use kasir_core::money::Money;
    /// use kasir_core::types::TaxRate;
    ///
    /// let subtotal = Money::from_minor(25_000);
    /// let tax = subtotal.calculate_tax(TaxRate::from_bps(1000)); // 10%
    /// assert_eq!(tax.minor(), 2_500);
    /// ```
    pub fn calculate_tax(&self, rate: TaxRate) -> Money {
        // i128 keeps large totals from overflowing before the division
        let tax = (self.0 as i128 * rate.bps() as i128 + 5000) / 10000;
        Money::from_minor(tax as i64)
    }

    /// Multiplies money by a quantity.
    ///
    /// ## Example
    /// ```rust
    /// use kasir_core::money::Money;
    ///
    /// let unit_price = Money::from_minor(10_000);
    /// assert_eq!(unit_price.multiply_quantity(2).minor(), 20_000);
    /// ```
    #[inline]
    pub const fn multiply_quantity(&self, qty: i64) -> Self {
        Money(self.0 * qty)
    }

    /// Checked multiplication, `None` on overflow.
    #[inline]
    pub fn checked_mul(&self, qty: i64) -> Option<Money> {
        self.0.checked_mul(qty).map(Money)
    }

    /// Checked addition, `None` on overflow.
    #[inline]
    pub fn checked_add(&self, other: Money) -> Option<Money> {
        self.0.checked_add(other.0).map(Money)
    }
}

// =============================================================================
// Trait Implementations
// =============================================================================

/// Plain integer with digit grouping, e.g. `-1,250,000`.
///
/// ## Note
/// This is for logs and receipts in tests. The UI owns real localization.
impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let digits = self.0.unsigned_abs().to_string();
        let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
        for (i, ch) in digits.chars().enumerate() {
            if i > 0 && (digits.len() - i) % 3 == 0 {
                grouped.push(',');
            }
            grouped.push(ch);
        }
        if self.0 < 0 {
            write!(f, "-{}", grouped)
        } else {
            write!(f, "{}", grouped)
        }
    }
}

impl Add for Money {
    type Output = Self;

    #[inline]
    fn add(self, other: Self) -> Self {
        Money(self.0 + other.0)
    }
}

impl AddAssign for Money {
    #[inline]
    fn add_assign(&mut self, other: Self) {
        self.0 += other.0;
    }
}

impl Sub for Money {
    type Output = Self;

    #[inline]
    fn sub(self, other: Self) -> Self {
        Money(self.0 - other.0)
    }
}

impl SubAssign for Money {
    #[inline]
    fn sub_assign(&mut self, other: Self) {
        self.0 -= other.0;
    }
}

impl Mul<i64> for Money {
    type Output = Self;

    #[inline]
    fn mul(self, qty: i64) -> Self {
        Money(self.0 * qty)
    }
}

impl Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Self {
        iter.fold(Money::zero(), |acc, m| acc + m)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_groups_digits() {
        assert_eq!(Money::from_minor(0).to_string(), "0");
        assert_eq!(Money::from_minor(999).to_string(), "999");
        assert_eq!(Money::from_minor(25_000).to_string(), "25,000");
        assert_eq!(Money::from_minor(-1_250_000).to_string(), "-1,250,000");
    }

    #[test]
    fn test_arithmetic() {
        let a = Money::from_minor(10_000);
        let b = Money::from_minor(5_000);

        assert_eq!((a + b).minor(), 15_000);
        assert_eq!((a - b).minor(), 5_000);
        assert_eq!((a * 3).minor(), 30_000);

        let total: Money = vec![a, b, b].into_iter().sum();
        assert_eq!(total.minor(), 20_000);
    }

    #[test]
    fn test_change_is_exact() {
        let paid = Money::from_minor(3_000_010);
        let total = Money::from_minor(2_499_995);
        assert_eq!((paid - total).minor(), 500_015);
    }

    #[test]
    fn test_tax_rounds_half_up() {
        // 1005 * 5% = 50.25 -> 50
        assert_eq!(
            Money::from_minor(1005)
                .calculate_tax(TaxRate::from_bps(500))
                .minor(),
            50
        );
        // 1010 * 5% = 50.5 -> 51
        assert_eq!(
            Money::from_minor(1010)
                .calculate_tax(TaxRate::from_bps(500))
                .minor(),
            51
        );
        assert!(Money::from_minor(25_000)
            .calculate_tax(TaxRate::zero())
            .is_zero());
    }

    #[test]
    fn test_checked_ops() {
        assert_eq!(
            Money::from_minor(i64::MAX).checked_add(Money::from_minor(1)),
            None
        );
        assert_eq!(Money::from_minor(i64::MAX / 2 + 1).checked_mul(2), None);
        assert_eq!(
            Money::from_minor(500).checked_mul(3),
            Some(Money::from_minor(1500))
        );
    }

    #[test]
    fn test_serializes_as_bare_integer() {
        let json = serde_json::to_string(&Money::from_minor(15_000)).unwrap();
        assert_eq!(json, "15000");
        let back: Money = serde_json::from_str("15000").unwrap();
        assert_eq!(back, Money::from_minor(15_000));
    }
}
