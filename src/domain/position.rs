use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::AccountId;

/// Market value of a holding.
///
/// There is deliberately no way to build a `Priced` value without an observed
/// price: a position whose price could not be fetched is `Unvaluable` and must
/// be excluded from counts, caps and exposure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Valuation {
    Priced { price: Decimal, notional: Decimal },
    Unvaluable { reason: String },
}

impl Valuation {
    pub fn priced(price: Decimal, quantity: Decimal) -> Self {
        Valuation::Priced {
            price,
            notional: price * quantity,
        }
    }

    pub fn notional(&self) -> Option<Decimal> {
        match self {
            Valuation::Priced { notional, .. } => Some(*notional),
            Valuation::Unvaluable { .. } => None,
        }
    }

    pub fn is_valuable(&self) -> bool {
        matches!(self, Valuation::Priced { .. })
    }
}

/// A holding reported by the exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub account_id: AccountId,
    pub symbol: String,
    pub quantity: Decimal,
    pub valuation: Valuation,
}

impl Position {
    pub fn notional(&self) -> Option<Decimal> {
        self.valuation.notional()
    }

    /// Priced but worth less than `threshold`
    pub fn is_dust(&self, threshold: Decimal) -> bool {
        matches!(self.notional(), Some(n) if n < threshold)
    }

    /// Counts toward caps: priced and above the dust threshold
    pub fn is_material(&self, dust_threshold: Decimal) -> bool {
        self.valuation.is_valuable() && !self.is_dust(dust_threshold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn pos(valuation: Valuation) -> Position {
        Position {
            account_id: AccountId::from("master"),
            symbol: "SOL".to_string(),
            quantity: dec!(2),
            valuation,
        }
    }

    #[test]
    fn test_unvaluable_is_never_material_or_dust() {
        let p = pos(Valuation::Unvaluable {
            reason: "no quote".to_string(),
        });
        assert!(!p.is_material(dec!(1)));
        assert!(!p.is_dust(dec!(1)));
        assert_eq!(p.notional(), None);
    }

    #[test]
    fn test_dust_threshold() {
        let p = pos(Valuation::priced(dec!(0.40), dec!(2)));
        assert_eq!(p.notional(), Some(dec!(0.80)));
        assert!(p.is_dust(dec!(1)));
        assert!(!p.is_material(dec!(1)));
        assert!(p.is_material(dec!(0.5)));
    }
}
