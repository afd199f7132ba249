//! Provider wire format.

use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;

#[derive(Debug, Serialize)]
pub struct TokenRequest<'a> {
    pub grant_type: &'static str,
    pub client_id: &'a str,
    pub client_secret: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub expires_in: Option<i64>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BuyTicketRequest {
    pub ticket_id: u64,
    pub quantity: u32,
    /// Device QR payload, sent only when the device-QR feature is on
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qrcode: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BuyTicketResponse {
    #[serde(default)]
    pub data: Vec<PurchasedTicket>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PurchasedTicket {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub qr_content: Option<String>,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub ticket_id: Option<i64>,
    #[serde(default)]
    pub valid_from: Option<JsonValue>,
    #[serde(default)]
    pub valid_to: Option<JsonValue>,
}

/// `GET /api/ticket` listing
#[derive(Debug, Deserialize)]
pub struct TicketCatalog {
    #[serde(default)]
    pub data: Vec<CatalogEntry>,
}

#[derive(Debug, Deserialize)]
pub struct CatalogEntry {
    #[serde(default, alias = "id", deserialize_with = "lenient_i64")]
    pub ticket_id: Option<i64>,
}

/// Outcome of one provider request. `error` is empty when `ok`.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderResponse {
    pub ok: bool,
    /// HTTP status, 0 when no response was received
    pub status: u16,
    pub body: Option<JsonValue>,
    pub error: String,
}

impl ProviderResponse {
    pub fn failure(status: u16, body: Option<JsonValue>, error: impl Into<String>) -> Self {
        Self {
            ok: false,
            status,
            body,
            error: error.into(),
        }
    }
}

/// Provider timestamps arrive as RFC 3339, `YYYY-MM-DD HH:MM:SS` (UTC) or epoch
/// seconds, as a string or a number.
pub fn parse_provider_timestamp(value: &JsonValue) -> Option<i64> {
    match value {
        JsonValue::Number(n) => n.as_i64(),
        JsonValue::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                return None;
            }
            if let Ok(secs) = s.parse::<i64>() {
                return Some(secs);
            }
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.timestamp());
            }
            ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"]
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
                .map(|dt| dt.and_utc().timestamp())
        }
        _ => None,
    }
}

/// Accepts integers given as numbers or numeric strings.
fn lenient_i64<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(value.and_then(|v| match v {
        JsonValue::Number(n) => n.as_i64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn buy_request_omits_absent_qrcode() {
        let body = serde_json::to_value(BuyTicketRequest {
            ticket_id: 101,
            quantity: 1,
            qrcode: None,
        })
        .unwrap();
        assert_eq!(body, json!({"ticket_id": 101, "quantity": 1}));
    }

    #[test]
    fn purchased_ticket_tolerates_string_ids() {
        let parsed: BuyTicketResponse = serde_json::from_value(json!({
            "data": [{"code": "P-1", "ticket_id": "77", "valid_to": "2026-01-01 10:30:00"}]
        }))
        .unwrap();
        assert_eq!(parsed.data[0].ticket_id, Some(77));
        assert_eq!(parsed.data[0].qr_content, None);
    }

    #[test]
    fn timestamps_in_several_shapes() {
        assert_eq!(
            parse_provider_timestamp(&json!("2026-01-01T10:00:00Z")),
            Some(1_767_261_600)
        );
        assert_eq!(
            parse_provider_timestamp(&json!("2026-01-01 10:00:00")),
            Some(1_767_261_600)
        );
        assert_eq!(parse_provider_timestamp(&json!(1_767_261_600)), Some(1_767_261_600));
        assert_eq!(parse_provider_timestamp(&json!("tomorrow")), None);
        assert_eq!(parse_provider_timestamp(&json!(null)), None);
    }

    #[test]
    fn catalog_accepts_id_alias() {
        let parsed: TicketCatalog =
            serde_json::from_value(json!({"data": [{"id": 5}, {"ticket_id": "6"}]})).unwrap();
        let ids: Vec<_> = parsed.data.iter().filter_map(|e| e.ticket_id).collect();
        assert_eq!(ids, vec![5, 6]);
    }
}
