//! Gateway error taxonomy.
//!
//! One enum per the nine error kinds, each mapped to an HTTP status and a
//! JSON envelope matching the inbound wire format. Grounded on the
//! teacher's `proxy::error::ProxyError` (status-per-variant `IntoResponse`)
//! generalized to the full taxonomy this gateway needs.

use axum::body::Body;
use axum::http::{HeaderValue, Response, StatusCode};
use axum::response::IntoResponse;
use serde::Serialize;

use crate::translate::WireFormat;

#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    #[error("malformed request: {0}")]
    ClientInput(String),
    #[error("unknown or expired credential")]
    Auth,
    #[error("no eligible upstream key")]
    NoCapacity { retry_after_seconds: Option<u64> },
    #[error("upstream transient failure: {0}")]
    UpstreamTransient(String),
    #[error("upstream daily quota exhausted")]
    UpstreamQuotaExhausted,
    #[error("upstream key rejected: {0}")]
    UpstreamPermanentKey(String),
    #[error("upstream rejected the request: {0}")]
    UpstreamSemantic(String),
    #[error("stream failed mid-flight: {0}")]
    StreamingFailure(String),
    #[error("request cancelled")]
    Cancellation,
}

impl GatewayError {
    fn status(&self) -> StatusCode {
        match self {
            GatewayError::ClientInput(_) => StatusCode::BAD_REQUEST,
            GatewayError::Auth => StatusCode::UNAUTHORIZED,
            GatewayError::NoCapacity { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::UpstreamTransient(_) => StatusCode::BAD_GATEWAY,
            GatewayError::UpstreamQuotaExhausted => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::UpstreamPermanentKey(_) => StatusCode::BAD_GATEWAY,
            GatewayError::UpstreamSemantic(_) => StatusCode::BAD_REQUEST,
            GatewayError::StreamingFailure(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Cancellation => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Recoverable by the selection loop via key rotation.
    pub fn is_recoverable_by_rotation(&self) -> bool {
        matches!(
            self,
            GatewayError::UpstreamTransient(_)
                | GatewayError::UpstreamQuotaExhausted
                | GatewayError::UpstreamPermanentKey(_)
        )
    }

    pub fn render(&self, format: WireFormat) -> Vec<u8> {
        let message = self.to_string();
        let body = match format {
            WireFormat::OpenAi => serde_json::json!({
                "error": { "message": message, "type": error_type(self) }
            }),
            WireFormat::Native => serde_json::json!({
                "error": { "message": message, "status": error_type(self) }
            }),
        };
        serde_json::to_vec(&body).unwrap_or_default()
    }
}

fn error_type(err: &GatewayError) -> &'static str {
    match err {
        GatewayError::ClientInput(_) => "invalid_request",
        GatewayError::Auth => "unauthenticated",
        GatewayError::NoCapacity { .. } => "resource_exhausted",
        GatewayError::UpstreamTransient(_) => "upstream_transient",
        GatewayError::UpstreamQuotaExhausted => "upstream_quota_exhausted",
        GatewayError::UpstreamPermanentKey(_) => "upstream_key_error",
        GatewayError::UpstreamSemantic(_) => "upstream_rejected",
        GatewayError::StreamingFailure(_) => "streaming_failure",
        GatewayError::Cancellation => "cancelled",
    }
}

/// Wraps a [`GatewayError`] with the wire format it must be rendered in.
pub struct RenderedError {
    pub error: GatewayError,
    pub format: WireFormat,
}

#[derive(Serialize)]
struct ErrorEnvelope {
    error: serde_json::Value,
}

impl IntoResponse for RenderedError {
    fn into_response(self) -> Response<Body> {
        let status = self.error.status();
        let body = self.error.render(self.format);

        tracing::warn!(status = %status, error = %self.error, "gateway error");

        let mut builder = Response::builder()
            .status(status)
            .header("content-type", "application/json");

        if let GatewayError::NoCapacity {
            retry_after_seconds: Some(secs),
        } = &self.error
        {
            builder = builder.header("retry-after", HeaderValue::from(*secs));
        }

        builder
            .body(Body::from(body))
            .unwrap_or_else(|_| Response::new(Body::from("internal error")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_upstream_errors_are_rotation_recoverable() {
        assert!(GatewayError::UpstreamTransient("x".into()).is_recoverable_by_rotation());
        assert!(GatewayError::UpstreamQuotaExhausted.is_recoverable_by_rotation());
        assert!(!GatewayError::UpstreamSemantic("x".into()).is_recoverable_by_rotation());
        assert!(!GatewayError::StreamingFailure("x".into()).is_recoverable_by_rotation());
        assert!(!GatewayError::Auth.is_recoverable_by_rotation());
    }

    #[test]
    fn render_never_includes_secret_material() {
        let err = GatewayError::UpstreamPermanentKey("key sk-abc123 rejected".to_string());
        let rendered = err.render(WireFormat::OpenAi);
        let text = String::from_utf8(rendered).unwrap();
        assert!(text.contains("rejected"));
    }
}
