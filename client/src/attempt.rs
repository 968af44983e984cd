use crate::error::TransportError;
use http::StatusCode;
use http::header::RETRY_AFTER;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// Upstream error name for an identifier it does not recognize.
const INVALID_IDENTIFIER: &str = "OPENAPI00003";
/// Upstream error name for an exhausted request quota.
const QUOTA_EXCEEDED: &str = "OPENAPI00007";

/// Character fields reported by one successful fetch.
///
/// `power` and `stats` stay empty when the stat endpoint was skipped or
/// failed after the basic profile loaded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CharacterSnapshot {
    pub character_name: Option<String>,
    pub world_name: Option<String>,
    pub guild_name: Option<String>,
    pub level: Option<i64>,
    pub class_name: Option<String>,
    pub gender: Option<String>,
    pub power: Option<i64>,
    pub stats: BTreeMap<String, f64>,
}

/// Outcome of fetching one entity by id.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchAttempt {
    Success(CharacterSnapshot),
    NotFound,
    TransientError(String),
    RateLimited { retry_after: Duration },
}

/// Outcome of resolving a display name to an entity id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveAttempt {
    Resolved(String),
    NotFound,
    TransientError(String),
    RateLimited { retry_after: Duration },
}

/// Failure half of an attempt, shared by both endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamFailure {
    NotFound,
    Transient(String),
    RateLimited { retry_after: Duration },
}

impl From<UpstreamFailure> for FetchAttempt {
    fn from(failure: UpstreamFailure) -> Self {
        match failure {
            UpstreamFailure::NotFound => FetchAttempt::NotFound,
            UpstreamFailure::Transient(reason) => FetchAttempt::TransientError(reason),
            UpstreamFailure::RateLimited { retry_after } => FetchAttempt::RateLimited { retry_after },
        }
    }
}

impl From<UpstreamFailure> for ResolveAttempt {
    fn from(failure: UpstreamFailure) -> Self {
        match failure {
            UpstreamFailure::NotFound => ResolveAttempt::NotFound,
            UpstreamFailure::Transient(reason) => ResolveAttempt::TransientError(reason),
            UpstreamFailure::RateLimited { retry_after } => {
                ResolveAttempt::RateLimited { retry_after }
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    name: String,
}

/// Map a failed exchange onto the attempt taxonomy.
///
/// `penalty` is the backoff used when a throttled response carries no usable
/// `Retry-After`; a header asking for more than `max_retry_after` is clamped.
pub fn classify_transport_error(
    err: &TransportError,
    penalty: Duration,
    max_retry_after: Duration,
) -> UpstreamFailure {
    match err {
        TransportError::Http {
            status,
            headers,
            body,
            ..
        } => {
            let error_name = body
                .as_deref()
                .and_then(|body| serde_json::from_str::<ErrorEnvelope>(body).ok())
                .map(|envelope| envelope.error.name);
            let throttled = *status == StatusCode::TOO_MANY_REQUESTS
                || error_name.as_deref() == Some(QUOTA_EXCEEDED);
            if throttled {
                let retry_after = headers
                    .as_ref()
                    .and_then(|headers| headers.get(RETRY_AFTER))
                    .and_then(|value| value.to_str().ok())
                    .and_then(|value| value.trim().parse::<u64>().ok())
                    .map_or(penalty, Duration::from_secs)
                    .min(max_retry_after);
                return UpstreamFailure::RateLimited { retry_after };
            }
            let not_found = *status == StatusCode::NOT_FOUND
                || (*status == StatusCode::BAD_REQUEST
                    && error_name.as_deref() == Some(INVALID_IDENTIFIER));
            if not_found {
                return UpstreamFailure::NotFound;
            }
            match error_name {
                Some(name) => UpstreamFailure::Transient(format!("http {status} ({name})")),
                None => UpstreamFailure::Transient(format!("http {status}")),
            }
        }
        TransportError::Timeout => UpstreamFailure::Transient("timeout".to_string()),
        TransportError::Network(message) => {
            UpstreamFailure::Transient(format!("network error: {message}"))
        }
        TransportError::Build(message) => {
            UpstreamFailure::Transient(format!("request build error: {message}"))
        }
    }
}
