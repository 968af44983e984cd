//! HTTP access to the game-statistics Open API under a shared rate budget.
//!
//! [`OpenApiClient`] turns every upstream exchange into a [`FetchAttempt`] or
//! [`ResolveAttempt`]; nothing here touches persisted state.

mod api;
mod attempt;
mod error;
mod request;
mod token_bucket;
mod transport;

pub use crate::api::API_KEY_HEADER;
pub use crate::api::CharacterSource;
pub use crate::api::DEFAULT_BASE_URL;
pub use crate::api::OpenApiClient;
pub use crate::api::OpenApiConfig;
pub use crate::api::POWER_STAT_NAME;
pub use crate::attempt::CharacterSnapshot;
pub use crate::attempt::FetchAttempt;
pub use crate::attempt::ResolveAttempt;
pub use crate::attempt::UpstreamFailure;
pub use crate::attempt::classify_transport_error;
pub use crate::error::ApiError;
pub use crate::error::TransportError;
pub use crate::request::Request;
pub use crate::request::Response;
pub use crate::token_bucket::Cancelled;
pub use crate::token_bucket::MAX_PENALTY;
pub use crate::token_bucket::TokenBucket;
pub use crate::transport::HttpTransport;
pub use crate::transport::ReqwestTransport;
pub use crate::transport::upstream_request_id;
