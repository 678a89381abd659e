//! Classification of declarative-endpoint responses
//!
//! Pure functions over one status/body pair. The client performs no retries;
//! whether an error is retried is decided by [`Error::is_retryable`].

use serde_json::{json, Value};

use crate::error::TenantResult;
use crate::Error;

const MAX_BODY_IN_ERROR: usize = 512;

/// Classify a write (POST/PATCH) response
///
/// 200, 201 and 202 are success whatever the body says. Otherwise a
/// `results[]` array is a per-tenant report, an `error` object is a
/// structured rejection, and anything else is an opaque failure.
pub fn classify(status: u16, body: &[u8]) -> Result<(), Error> {
    if matches!(status, 200..=202) {
        return Ok(());
    }

    let Ok(response) = serde_json::from_slice::<Value>(body) else {
        return Err(Error::appliance(Some(status), excerpt(body)));
    };

    if let Some(results) = response.get("results").and_then(Value::as_array) {
        let results = results
            .iter()
            .map(|r| serde_json::from_value::<TenantResult>(r.clone()).unwrap_or_default())
            .collect();
        return Err(Error::TenantRejected { status, results });
    }

    if let Some(err) = response.get("error").filter(|e| e.is_object()) {
        return Err(Error::ApplianceRejected {
            status,
            code: scalar(err.get("code")),
            message: scalar(err.get("message")),
        });
    }

    Err(Error::appliance(
        Some(status),
        format!("responded with code {}", scalar(response.get("code"))),
    ))
}

/// Classify a declaration read and return the declaration
///
/// A 404 (tenant not declared) and a 2xx with an empty body (nothing
/// declared in Common yet) both read as `{}`.
pub fn classify_get(status: u16, body: &[u8]) -> Result<Value, Error> {
    if status == 404 {
        return Ok(json!({}));
    }
    if (200..300).contains(&status) {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(json!({}));
        }
        return Ok(serde_json::from_slice(body)?);
    }
    classify(status, body)?;
    Err(Error::appliance(Some(status), excerpt(body)))
}

fn scalar(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => "unknown".to_string(),
        Some(other) => other.to_string(),
    }
}

fn excerpt(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    let mut end = text.len().min(MAX_BODY_IN_ERROR);
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}
