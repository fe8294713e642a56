use crate::error::Error;
use crate::http::RawResponse;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Normalized response envelope returned by the generic request helpers.
///
/// Body handling never fails past this boundary: an empty body becomes an
/// empty object, a non-JSON body is kept as raw text with `text_content` set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse {
    pub ok: bool,
    pub status: u16,
    pub data: Value,
    pub error: Option<String>,
    pub text: String,
    pub text_content: bool,
}

impl ApiResponse {
    pub fn from_raw(raw: &RawResponse) -> Self {
        if raw.status == 0 {
            return Self {
                ok: false,
                status: 0,
                data: Value::Null,
                error: Some("network error".to_string()),
                text: String::new(),
                text_content: false,
            };
        }

        if raw.body.trim().is_empty() {
            return Self {
                ok: raw.ok(),
                status: raw.status,
                data: json!({}),
                error: (!raw.ok()).then(|| format!("HTTP error {}", raw.status)),
                text: String::new(),
                text_content: false,
            };
        }

        match serde_json::from_str::<Value>(&raw.body) {
            Ok(data) => {
                let server_error = error_message(&data);
                let ok = raw.ok() && server_error.is_none();
                let error = if raw.ok() {
                    server_error
                } else {
                    Some(
                        server_error
                            .unwrap_or_else(|| format!("HTTP error {}", raw.status)),
                    )
                };
                Self {
                    ok,
                    status: raw.status,
                    data,
                    error,
                    text: raw.body.clone(),
                    text_content: false,
                }
            }
            Err(err) => {
                log::debug!("Non-JSON response body ({}), keeping raw text", err);
                Self {
                    ok: raw.ok(),
                    status: raw.status,
                    data: Value::Null,
                    error: (!raw.ok()).then(|| format!("HTTP error {}", raw.status)),
                    text: raw.body.clone(),
                    text_content: true,
                }
            }
        }
    }

    pub fn from_error(error: &Error) -> Self {
        Self {
            ok: false,
            status: 0,
            data: Value::Null,
            error: Some(error.to_string()),
            text: String::new(),
            text_content: false,
        }
    }

    /// The server-provided message when present, else a generic one.
    pub fn message(&self) -> String {
        self.error
            .clone()
            .unwrap_or_else(|| format!("HTTP error {}", self.status))
    }
}

/// Extract an error message from a JSON payload (`detail` per the auth
/// endpoints, `error` per the resource endpoints, or an explicit `ok: false`).
fn error_message(data: &Value) -> Option<String> {
    if let Some(detail) = data.get("detail").and_then(Value::as_str) {
        return Some(detail.to_string());
    }
    if let Some(error) = data.get("error").and_then(Value::as_str) {
        return Some(error.to_string());
    }
    if data.get("ok").and_then(Value::as_bool) == Some(false) {
        return Some("request rejected by server".to_string());
    }
    None
}
