//! Finding the purchaser's email on a completed order.
//!
//! Billing email wins. Otherwise the payment gateway usually left the payer's
//! address somewhere in the order metadata: first the known keys, then the raw
//! gateway response, then any metadata value that looks like an email. The scan
//! is a heuristic and may pick up an unrelated address.

use regex::Regex;
use serde_json::Value as JsonValue;
use std::fmt;
use std::sync::LazyLock;

use crate::orders::Order;

/// Metadata keys gateways use for the payer email, checked in order. The flag
/// marks keys written by the Barion gateway.
pub const GATEWAY_EMAIL_KEYS: [(&str, bool); 4] = [
    ("_barion_payer_email", true),
    ("_barion_email", true),
    ("_payment_method_email", false),
    ("barion_payer_email", true),
];

/// Raw gateway response blob, scanned as JSON.
pub const GATEWAY_RESPONSE_KEY: &str = "_barion_response";

static EMAIL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9.!#$%&'*+/=?^_`{|}~-]+@[A-Za-z0-9](?:[A-Za-z0-9-]*[A-Za-z0-9])?(?:\.[A-Za-z0-9](?:[A-Za-z0-9-]*[A-Za-z0-9])?)+$")
        .expect("invalid email regex")
});

/// Where the resolved email came from; recorded as an order note.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmailSource {
    Billing,
    BarionMeta(String),
    BarionResponse,
    Meta(String),
    Absent,
}

impl fmt::Display for EmailSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmailSource::Billing => f.write_str("billing"),
            EmailSource::BarionMeta(key) => write!(f, "barion_meta:{}", key),
            EmailSource::BarionResponse => f.write_str("barion_response"),
            EmailSource::Meta(key) => write!(f, "meta:{}", key),
            EmailSource::Absent => f.write_str("absent"),
        }
    }
}

/// Trimmed address when it is a plausible email, else `None`.
pub fn sanitize_email(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    (trimmed.len() <= 254 && EMAIL_REGEX.is_match(trimmed)).then(|| trimmed.to_string())
}

pub fn resolve_email(order: &Order) -> (Option<String>, EmailSource) {
    if let Some(email) = order.billing_email.as_deref().and_then(sanitize_email) {
        return (Some(email), EmailSource::Billing);
    }

    for (key, barion) in GATEWAY_EMAIL_KEYS {
        let found = order
            .meta_value(key)
            .and_then(scalar_text)
            .and_then(|text| sanitize_email(&text));
        if let Some(email) = found {
            let source = if barion {
                EmailSource::BarionMeta(key.to_string())
            } else {
                EmailSource::Meta(key.to_string())
            };
            return (Some(email), source);
        }
    }

    if let Some(email) = order.meta_value(GATEWAY_RESPONSE_KEY).and_then(extract_email) {
        return (Some(email), EmailSource::BarionResponse);
    }

    for entry in &order.meta {
        if let Some(email) = extract_email(&entry.value) {
            return (Some(email), EmailSource::Meta(entry.key.clone()));
        }
    }

    (None, EmailSource::Absent)
}

fn scalar_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// First email inside a value. Strings holding JSON documents are decoded and searched.
fn extract_email(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => sanitize_email(s).or_else(|| {
            match serde_json::from_str::<JsonValue>(s) {
                Ok(decoded @ (JsonValue::Array(_) | JsonValue::Object(_))) => search(&decoded),
                _ => None,
            }
        }),
        JsonValue::Array(_) | JsonValue::Object(_) => search(value),
        _ => None,
    }
}

fn search(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Array(items) => items.iter().find_map(search),
        JsonValue::Object(map) => map.values().find_map(search),
        JsonValue::String(s) => sanitize_email(s),
        _ => None,
    }
}
