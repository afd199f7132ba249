//! Read model of a checkout order as seen by ticket issuance.
//!
//! The order system owns these records; issuance only reads the fields below and
//! writes back the linked ticket id, billing email and notes through
//! [`OrderStore`](crate::database::OrderStore).

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::tickets::{OrderId, TicketId, TicketType};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub product_id: i64,
    pub total: Decimal,
    pub tax: Decimal,
}

/// One gateway or checkout metadata value attached to the order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaEntry {
    pub key: String,
    pub value: JsonValue,
}

impl MetaEntry {
    pub fn new(key: impl Into<String>, value: JsonValue) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub customer_id: Option<i64>,
    pub billing_email: Option<String>,
    pub currency: String,
    pub line_items: Vec<LineItem>,
    /// Raw ticket type tag set at checkout (`30m` / `60m`).
    pub ticket_type_tag: Option<String>,
    /// QR payload from the purchaser's device, forwarded to the provider when enabled.
    pub device_qr: Option<String>,
    /// Idempotency marker: the ticket already issued for this order.
    pub ticket_id: Option<TicketId>,
    pub meta: Vec<MetaEntry>,
}

impl Order {
    pub fn new(id: OrderId, currency: impl Into<String>) -> Self {
        Self {
            id,
            customer_id: None,
            billing_email: None,
            currency: currency.into(),
            line_items: Vec::new(),
            ticket_type_tag: None,
            device_qr: None,
            ticket_id: None,
            meta: Vec::new(),
        }
    }

    pub fn ticket_type(&self) -> Option<TicketType> {
        self.ticket_type_tag.as_deref()?.parse().ok()
    }

    pub fn meta_value(&self, key: &str) -> Option<&JsonValue> {
        self.meta.iter().find(|m| m.key == key).map(|m| &m.value)
    }

    /// Gross amount of the first line item (total + tax) in minor units.
    pub fn gross_amount_cents(&self) -> i64 {
        self.line_items
            .first()
            .and_then(|item| {
                ((item.total + item.tax) * Decimal::from(100))
                    .round()
                    .to_i64()
            })
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn gross_amount_uses_first_line_item_with_tax() {
        let mut order = Order::new(1, "EUR");
        order.line_items.push(LineItem {
            product_id: 10,
            total: Decimal::from_str("0.98").unwrap(),
            tax: Decimal::from_str("0.225").unwrap(),
        });
        order.line_items.push(LineItem {
            product_id: 11,
            total: Decimal::from(5),
            tax: Decimal::ZERO,
        });
        assert_eq!(order.gross_amount_cents(), 121);
    }

    #[test]
    fn missing_line_items_mean_zero_amount() {
        assert_eq!(Order::new(1, "EUR").gross_amount_cents(), 0);
    }

    #[test]
    fn ticket_type_tag_is_parsed() {
        let mut order = Order::new(1, "EUR");
        assert_eq!(order.ticket_type(), None);
        order.ticket_type_tag = Some("60M".to_string());
        assert_eq!(order.ticket_type(), Some(TicketType::SixtyMinutes));
        order.ticket_type_tag = Some("day-pass".to_string());
        assert_eq!(order.ticket_type(), None);
    }
}
