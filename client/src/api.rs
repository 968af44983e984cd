use crate::attempt::CharacterSnapshot;
use crate::attempt::FetchAttempt;
use crate::attempt::ResolveAttempt;
use crate::attempt::UpstreamFailure;
use crate::attempt::classify_transport_error;
use crate::error::ApiError;
use crate::error::TransportError;
use crate::request::Request;
use crate::token_bucket::TokenBucket;
use crate::transport::HttpTransport;
use crate::transport::upstream_request_id;
use async_trait::async_trait;
use bytes::Bytes;
use http::HeaderMap;
use http::HeaderValue;
use http::Method;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

pub const DEFAULT_BASE_URL: &str = "https://open.api.nexon.com/maplestorytw/v1";
pub const API_KEY_HEADER: &str = "x-nxopen-api-key";
/// `final_stat` entry that carries combat power.
pub const POWER_STAT_NAME: &str = "戰鬥力";

const ID_ENDPOINT: &str = "/id";
const BASIC_ENDPOINT: &str = "/character/basic";
const STAT_ENDPOINT: &str = "/character/stat";

/// Where the engine gets character data from.
///
/// Both calls return `None` only when `cancel` fired before a request could
/// be sent.
#[async_trait]
pub trait CharacterSource: Send + Sync {
    async fn fetch(&self, entity_id: &str, cancel: &CancellationToken) -> Option<FetchAttempt>;

    async fn resolve(
        &self,
        display_name: &str,
        cancel: &CancellationToken,
    ) -> Option<ResolveAttempt>;
}

#[derive(Debug, Clone)]
pub struct OpenApiConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout: Duration,
    /// Characters below this level skip the stat endpoint.
    pub stat_min_level: i64,
    /// Backoff applied when a throttled response has no `Retry-After`.
    pub rate_limit_penalty: Duration,
    /// Upper bound on a `Retry-After` the upstream asks for.
    pub max_retry_after: Duration,
}

/// [`CharacterSource`] backed by the Open API, one bucket token per request.
pub struct OpenApiClient<T: HttpTransport> {
    transport: T,
    bucket: Arc<TokenBucket>,
    config: OpenApiConfig,
    headers: HeaderMap,
}

impl<T: HttpTransport> OpenApiClient<T> {
    pub fn new(
        transport: T,
        bucket: Arc<TokenBucket>,
        config: OpenApiConfig,
    ) -> Result<Self, TransportError> {
        let mut key = HeaderValue::from_str(config.api_key.as_str())
            .map_err(|err| TransportError::Build(format!("invalid api key header: {err}")))?;
        key.set_sensitive(true);
        let mut headers = HeaderMap::new();
        headers.insert(API_KEY_HEADER, key);
        Ok(Self {
            transport,
            bucket,
            config,
            headers,
        })
    }

    pub fn bucket(&self) -> &Arc<TokenBucket> {
        &self.bucket
    }

    fn endpoint_url(
        &self,
        endpoint: &'static str,
        params: &[(&str, &str)],
    ) -> Result<Url, ApiError> {
        let base = self.config.base_url.trim_end_matches('/');
        Url::parse_with_params(&format!("{base}{endpoint}"), params).map_err(|err| {
            ApiError::Url {
                endpoint,
                message: err.to_string(),
            }
        })
    }

    /// One rate-limited GET. Throttled responses penalize the shared bucket.
    async fn get(
        &self,
        endpoint: &'static str,
        params: &[(&str, &str)],
        cancel: &CancellationToken,
    ) -> Option<Result<Bytes, UpstreamFailure>> {
        if self.bucket.acquire(cancel).await.is_err() {
            return None;
        }
        let url = match self.endpoint_url(endpoint, params) {
            Ok(url) => url,
            Err(err) => return Some(Err(UpstreamFailure::Transient(err.to_string()))),
        };
        let subject = params.first().map_or("", |(_, value)| *value);
        let request = Request::new(Method::GET, url.to_string())
            .with_headers(self.headers.clone())
            .with_timeout(self.config.timeout);
        match self.transport.execute(request).await {
            Ok(response) => {
                debug!(
                    endpoint,
                    subject,
                    status = response.status.as_u16(),
                    request_id = upstream_request_id(&response.headers),
                    "upstream request completed"
                );
                Some(Ok(response.body))
            }
            Err(err) => {
                let failure = classify_transport_error(
                    &err,
                    self.config.rate_limit_penalty,
                    self.config.max_retry_after,
                );
                if let UpstreamFailure::RateLimited { retry_after } = &failure {
                    self.bucket.penalize(*retry_after).await;
                }
                let request_id = match &err {
                    TransportError::Http {
                        headers: Some(headers),
                        ..
                    } => upstream_request_id(headers),
                    _ => None,
                };
                debug!(endpoint, subject, request_id, ?failure, "upstream request failed");
                Some(Err(failure))
            }
        }
    }

    async fn load_stats(
        &self,
        entity_id: &str,
        snapshot: &mut CharacterSnapshot,
        cancel: &CancellationToken,
    ) {
        let body = match self.get(STAT_ENDPOINT, &[("ocid", entity_id)], cancel).await {
            Some(Ok(body)) => body,
            Some(Err(failure)) => {
                debug!(entity_id, ?failure, "stat fetch failed, keeping basic profile");
                return;
            }
            None => return,
        };
        match decode::<StatResponse>(STAT_ENDPOINT, &body) {
            Ok(stat) => stat.apply_to(snapshot),
            Err(err) => debug!(entity_id, error = %err, "stat response unusable"),
        }
    }
}

#[async_trait]
impl<T: HttpTransport> CharacterSource for OpenApiClient<T> {
    async fn fetch(&self, entity_id: &str, cancel: &CancellationToken) -> Option<FetchAttempt> {
        let body = match self.get(BASIC_ENDPOINT, &[("ocid", entity_id)], cancel).await? {
            Ok(body) => body,
            Err(failure) => return Some(failure.into()),
        };
        let mut snapshot = match decode::<BasicResponse>(BASIC_ENDPOINT, &body) {
            Ok(basic) => basic.into_snapshot(),
            Err(err) => return Some(FetchAttempt::TransientError(err.to_string())),
        };
        if snapshot
            .level
            .is_some_and(|level| level >= self.config.stat_min_level)
        {
            self.load_stats(entity_id, &mut snapshot, cancel).await;
        }
        Some(FetchAttempt::Success(snapshot))
    }

    async fn resolve(
        &self,
        display_name: &str,
        cancel: &CancellationToken,
    ) -> Option<ResolveAttempt> {
        let display_name = display_name.trim();
        if display_name.is_empty() {
            return Some(ResolveAttempt::NotFound);
        }
        let body = match self
            .get(ID_ENDPOINT, &[("character_name", display_name)], cancel)
            .await?
        {
            Ok(body) => body,
            Err(failure) => return Some(failure.into()),
        };
        Some(match decode::<IdResponse>(ID_ENDPOINT, &body) {
            Ok(IdResponse {
                ocid: Some(ocid), ..
            }) if !ocid.trim().is_empty() => ResolveAttempt::Resolved(ocid.trim().to_string()),
            Ok(_) => ResolveAttempt::NotFound,
            Err(err) => ResolveAttempt::TransientError(err.to_string()),
        })
    }
}

fn decode<D: DeserializeOwned>(endpoint: &'static str, body: &[u8]) -> Result<D, ApiError> {
    serde_json::from_slice(body).map_err(|source| ApiError::Decode { endpoint, source })
}

#[derive(Debug, Deserialize)]
struct IdResponse {
    ocid: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BasicResponse {
    character_name: Option<String>,
    world_name: Option<String>,
    character_gender: Option<String>,
    character_class: Option<String>,
    character_level: Option<i64>,
    character_guild_name: Option<String>,
}

impl BasicResponse {
    fn into_snapshot(self) -> CharacterSnapshot {
        CharacterSnapshot {
            character_name: non_blank(self.character_name),
            world_name: non_blank(self.world_name),
            guild_name: non_blank(self.character_guild_name),
            level: self.character_level,
            class_name: non_blank(self.character_class),
            gender: non_blank(self.character_gender),
            ..CharacterSnapshot::default()
        }
    }
}

#[derive(Debug, Deserialize)]
struct StatResponse {
    #[serde(default)]
    final_stat: Vec<FinalStat>,
}

#[derive(Debug, Deserialize)]
struct FinalStat {
    stat_name: Option<String>,
    stat_value: Option<String>,
}

impl StatResponse {
    fn apply_to(self, snapshot: &mut CharacterSnapshot) {
        for stat in self.final_stat {
            let (Some(name), Some(value)) = (stat.stat_name, stat.stat_value) else {
                continue;
            };
            let Ok(value) = value.trim().parse::<f64>() else {
                continue;
            };
            let name = name.trim().to_string();
            if name == POWER_STAT_NAME {
                snapshot.power = Some(value as i64);
            }
            snapshot.stats.insert(name, value);
        }
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
