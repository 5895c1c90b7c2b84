//! Exchange-side snapshots
//!
//! Loosely shaped views of the exchange's authoritative state, as returned by
//! the position and pending-order listings. Vendors disagree on field names
//! and on whether numbers arrive as strings, so fields stay optional and the
//! accessors do the defensive parsing.

use crate::value_objects::{Side, Symbol};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::str::FromStr;

// =============================================================================
// Live Position
// =============================================================================

/// An open position as reported by the exchange.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LivePosition {
    #[serde(default)]
    pub symbol: String,
    #[serde(default)]
    pub side: String,
    #[serde(default, deserialize_with = "loose_string")]
    pub position_id: Option<String>,
    #[serde(default, deserialize_with = "loose_string")]
    pub id: Option<String>,

    // Quantity, under whichever name the endpoint happens to use
    #[serde(default, deserialize_with = "loose_string")]
    pub qty: Option<String>,
    #[serde(default, deserialize_with = "loose_string")]
    pub position_qty: Option<String>,
    #[serde(default, deserialize_with = "loose_string")]
    pub hold_qty: Option<String>,
    #[serde(default, deserialize_with = "loose_string")]
    pub position_amt: Option<String>,
    #[serde(default, deserialize_with = "loose_string")]
    pub avail_qty: Option<String>,
    #[serde(default, deserialize_with = "loose_string")]
    pub position_size: Option<String>,

    #[serde(default, deserialize_with = "loose_string")]
    pub avg_open_price: Option<String>,
}

impl LivePosition {
    /// Live size: the first quantity field that is present and parses.
    ///
    /// Signed encodings (negative for shorts) are reported as a magnitude.
    /// Returns zero when no field is usable.
    pub fn quantity(&self) -> Decimal {
        [
            &self.qty,
            &self.position_qty,
            &self.hold_qty,
            &self.position_amt,
            &self.avail_qty,
            &self.position_size,
        ]
        .into_iter()
        .filter_map(|field| field.as_deref())
        .map(str::trim)
        .filter(|raw| !raw.is_empty())
        .find_map(|raw| Decimal::from_str(raw).ok())
        .map(|qty| qty.abs())
        .unwrap_or(Decimal::ZERO)
    }

    /// Exchange identity of the position, needed for stop-loss placement.
    pub fn identity(&self) -> Option<&str> {
        [&self.position_id, &self.id]
            .into_iter()
            .filter_map(|field| field.as_deref())
            .map(str::trim)
            .find(|id| !id.is_empty())
    }

    /// Whether this snapshot is the exposure tracked as `(symbol, side)`.
    pub fn matches(&self, symbol: &Symbol, side: Side) -> bool {
        Symbol::from_pair(&self.symbol).map(|s| &s == symbol).unwrap_or(false)
            && Side::parse(&self.side).map(|s| s == side).unwrap_or(false)
    }
}

// =============================================================================
// Pending Order
// =============================================================================

/// An order still resting on the exchange.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOrder {
    #[serde(default, deserialize_with = "loose_string")]
    pub order_id: Option<String>,
    #[serde(default)]
    pub symbol: String,
    #[serde(default)]
    pub side: String,
    #[serde(default)]
    pub order_type: String,
    #[serde(default, deserialize_with = "loose_bool")]
    pub reduce_only: bool,
    #[serde(default)]
    pub status: String,
    #[serde(default, deserialize_with = "loose_string")]
    pub trade_qty: Option<String>,
    #[serde(default, deserialize_with = "loose_string")]
    pub price: Option<String>,
    #[serde(default, deserialize_with = "loose_string")]
    pub qty: Option<String>,
}

impl PendingOrder {
    /// Quantity already executed against this order.
    pub fn filled_qty(&self) -> Decimal {
        self.trade_qty
            .as_deref()
            .and_then(|raw| Decimal::from_str(raw.trim()).ok())
            .unwrap_or(Decimal::ZERO)
    }

    /// An untouched limit entry for `(symbol, side)`: not reduce-only,
    /// still new, nothing traded yet.
    pub fn is_unfilled_entry(&self, symbol: &Symbol, side: Side) -> bool {
        Symbol::from_pair(&self.symbol).map(|s| &s == symbol).unwrap_or(false)
            && Side::parse(&self.side).map(|s| s == side).unwrap_or(false)
            && self.order_type.eq_ignore_ascii_case("LIMIT")
            && !self.reduce_only
            && self.status.to_ascii_uppercase().starts_with("NEW")
            && self.filled_qty().is_zero()
    }
}

// =============================================================================
// Lenient field decoding
// =============================================================================

fn loose_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

fn loose_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Bool(b)) => b,
        Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
        Some(Value::Number(n)) => n.as_i64().map(|v| v != 0).unwrap_or(false),
        _ => false,
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn btc() -> Symbol {
        Symbol::from_pair("BTCUSDT").unwrap()
    }

    #[test]
    fn test_quantity_takes_first_usable_field() {
        let json = r#"{"symbol":"BTCUSDT","side":"BUY","qty":"","positionQty":"0.25","holdQty":"9"}"#;
        let live: LivePosition = serde_json::from_str(json).unwrap();
        assert_eq!(live.quantity(), dec!(0.25));
    }

    #[test]
    fn test_quantity_accepts_numbers_and_negative_amounts() {
        let json = r#"{"symbol":"ETHUSDT","side":"SHORT","positionAmt":-1.5}"#;
        let live: LivePosition = serde_json::from_str(json).unwrap();
        assert_eq!(live.quantity(), dec!(1.5));
    }

    #[test]
    fn test_quantity_defaults_to_zero() {
        let live: LivePosition = serde_json::from_str(r#"{"symbol":"BTCUSDT"}"#).unwrap();
        assert_eq!(live.quantity(), Decimal::ZERO);
        assert!(live.identity().is_none());
    }

    #[test]
    fn test_identity_falls_back_to_id() {
        let json = r#"{"symbol":"BTCUSDT","side":"BUY","positionId":"","id":12345}"#;
        let live: LivePosition = serde_json::from_str(json).unwrap();
        assert_eq!(live.identity(), Some("12345"));
    }

    #[test]
    fn test_matches_symbol_and_side() {
        let live = LivePosition {
            symbol: "BTCUSDT".to_string(),
            side: "BUY".to_string(),
            ..Default::default()
        };
        assert!(live.matches(&btc(), Side::Long));
        assert!(!live.matches(&btc(), Side::Short));
        assert!(!live.matches(&Symbol::from_pair("ETHUSDT").unwrap(), Side::Long));
    }

    #[test]
    fn test_unfilled_entry_filter() {
        let entry = PendingOrder {
            order_id: Some("1".to_string()),
            symbol: "BTCUSDT".to_string(),
            side: "BUY".to_string(),
            order_type: "LIMIT".to_string(),
            reduce_only: false,
            status: "NEW_".to_string(),
            trade_qty: Some("0".to_string()),
            ..Default::default()
        };
        assert!(entry.is_unfilled_entry(&btc(), Side::Long));

        let take_profit = PendingOrder { reduce_only: true, ..entry.clone() };
        assert!(!take_profit.is_unfilled_entry(&btc(), Side::Long));

        let partially = PendingOrder { trade_qty: Some("0.1".to_string()), ..entry.clone() };
        assert!(!partially.is_unfilled_entry(&btc(), Side::Long));

        let market = PendingOrder { order_type: "MARKET".to_string(), ..entry.clone() };
        assert!(!market.is_unfilled_entry(&btc(), Side::Long));

        let other_side = PendingOrder { side: "SELL".to_string(), ..entry };
        assert!(!other_side.is_unfilled_entry(&btc(), Side::Long));
    }

    #[test]
    fn test_pending_order_loose_reduce_only() {
        let json = r#"{"orderId":99,"symbol":"BTCUSDT","side":"SELL","orderType":"LIMIT","reduceOnly":"true","status":"NEW"}"#;
        let order: PendingOrder = serde_json::from_str(json).unwrap();
        assert!(order.reduce_only);
        assert_eq!(order.order_id.as_deref(), Some("99"));
    }
}
