//! Parameter extraction for handlers.
//!
//! Handlers re-validate parameters the transport already checked; this is
//! the trust boundary. Missing or mistyped parameters surface as
//! `MISSING_PARAM` / `VALIDATION_ERROR` through [`ParamError`].

use chrono::{DateTime, Utc};

/// Parameter extraction failures, mapped to wire codes by handlers.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ParamError {
    #[error("Missing '{0}' in params")]
    Missing(&'static str),

    #[error("Param '{0}' has the wrong type, expected {1}")]
    WrongType(&'static str, &'static str),
}

pub fn require_str<'a>(
    params: &'a serde_json::Value,
    key: &'static str,
) -> Result<&'a str, ParamError> {
    match params.get(key) {
        None | Some(serde_json::Value::Null) => Err(ParamError::Missing(key)),
        Some(value) => value.as_str().ok_or(ParamError::WrongType(key, "string")),
    }
}

pub fn opt_str<'a>(params: &'a serde_json::Value, key: &str) -> Option<&'a str> {
    params.get(key).and_then(|v| v.as_str())
}

pub fn opt_i64(params: &serde_json::Value, key: &str) -> Option<i64> {
    params.get(key).and_then(|v| v.as_i64())
}

pub fn i64_or(params: &serde_json::Value, key: &str, default: i64) -> i64 {
    opt_i64(params, key).unwrap_or(default)
}

pub fn opt_f64(params: &serde_json::Value, key: &str) -> Option<f64> {
    params.get(key).and_then(|v| v.as_f64())
}

pub fn require_datetime(
    params: &serde_json::Value,
    key: &'static str,
) -> Result<DateTime<Utc>, ParamError> {
    let raw = require_str(params, key)?;
    raw.parse::<DateTime<Utc>>()
        .map_err(|_| ParamError::WrongType(key, "RFC 3339 timestamp"))
}

/// The inner method name for operations that sub-dispatch.
pub fn require_method(params: &serde_json::Value) -> Result<&str, ParamError> {
    require_str(params, "method")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_require_str() {
        let params = serde_json::json!({ "integration_id": "int-1", "count": 3 });
        assert_eq!(require_str(&params, "integration_id"), Ok("int-1"));
        assert_eq!(
            require_str(&params, "missing"),
            Err(ParamError::Missing("missing"))
        );
        assert_eq!(
            require_str(&params, "count"),
            Err(ParamError::WrongType("count", "string"))
        );
    }

    #[test]
    fn test_datetime_parsing() {
        let params = serde_json::json!({ "period_start": "2026-08-01T00:00:00Z", "bad": "yesterday" });
        assert!(require_datetime(&params, "period_start").is_ok());
        assert!(require_datetime(&params, "bad").is_err());
    }

    #[test]
    fn test_numeric_defaults() {
        let params = serde_json::json!({ "estimated_cost_cents": 12 });
        assert_eq!(i64_or(&params, "estimated_cost_cents", 0), 12);
        assert_eq!(i64_or(&params, "estimated_tokens", 0), 0);
    }
}
