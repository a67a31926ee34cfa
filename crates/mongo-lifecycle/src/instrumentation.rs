//! Tracing instrumentation for session operations.
//!
//! Every network operation of the manager runs inside a span named after
//! the operation. Fields follow the OpenTelemetry database conventions so the
//! spans can be exported unchanged by a `tracing-opentelemetry` layer installed
//! by the host:
//!
//! - `db.system`: "mongodb"
//! - `db.name`: database name, when known
//! - `server.address`: connection URI with the password redacted
//! - `component`: name of the owning manager

use tracing::Span;

/// Database system identifier for MongoDB.
pub const DB_SYSTEM: &str = "mongodb";

/// Span names for session operations.
pub mod span_names {
    /// Span name for session creation.
    pub const DIAL: &str = "mongo.dial";
    /// Span name for establishing the connection.
    pub const CONNECT: &str = "mongo.connect";
    /// Span name for the liveness probe.
    pub const PING: &str = "mongo.ping";
    /// Span name for closing the connection.
    pub const DISCONNECT: &str = "mongo.disconnect";
}

/// Create the span for a session operation.
pub(crate) fn operation_span(
    operation: &'static str,
    component: &str,
    uri: &str,
    database: Option<&str>,
) -> Span {
    tracing::info_span!(
        "mongo.operation",
        otel.name = operation,
        db.system = DB_SYSTEM,
        db.name = database.unwrap_or_default(),
        server.address = %redact_uri(uri),
        component = component,
    )
}

/// Replace the password in a connection URI with `***`.
///
/// URIs without credentials are returned unchanged.
#[must_use]
pub fn redact_uri(uri: &str) -> String {
    let Some(scheme_end) = uri.find("://") else {
        return uri.to_string();
    };
    let authority_start = scheme_end + 3;
    let rest = &uri[authority_start..];
    let authority_end = rest.find(['/', '?']).unwrap_or(rest.len());
    let authority = &rest[..authority_end];

    let Some(at) = authority.rfind('@') else {
        return uri.to_string();
    };
    let userinfo = &authority[..at];
    let Some(colon) = userinfo.find(':') else {
        return uri.to_string();
    };

    format!(
        "{}{}:***{}",
        &uri[..authority_start],
        &userinfo[..colon],
        &uri[authority_start + at..]
    )
}
