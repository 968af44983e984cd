use crate::error::TransportError;
use crate::request::Request;
use crate::request::Response;
use async_trait::async_trait;
use http::HeaderMap;
use tracing::trace;

/// Upstream headers that identify one exchange, checked in order.
const REQUEST_ID_HEADERS: [&str; 2] = ["cf-ray", "x-request-id"];

/// Sends one request. Non-2xx statuses come back as [`TransportError::Http`]
/// with the body attached so callers can classify upstream error codes.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn execute(&self, req: Request) -> Result<Response, TransportError>;
}

#[derive(Clone, Debug)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn map_error(err: reqwest::Error) -> TransportError {
        if err.is_timeout() {
            TransportError::Timeout
        } else if err.is_builder() {
            TransportError::Build(err.to_string())
        } else {
            TransportError::Network(err.to_string())
        }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn execute(&self, req: Request) -> Result<Response, TransportError> {
        let Request {
            method,
            url,
            headers,
            timeout,
        } = req;
        trace!("{method} to {url}");

        let mut builder = self.client.request(method, url.as_str()).headers(headers);
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let resp = builder.send().await.map_err(Self::map_error)?;
        let status = resp.status();
        let headers = resp.headers().clone();
        let bytes = resp.bytes().await.map_err(Self::map_error)?;
        if !status.is_success() {
            let body = String::from_utf8(bytes.to_vec()).ok();
            return Err(TransportError::Http {
                status,
                url: Some(url),
                headers: Some(headers),
                body,
            });
        }
        Ok(Response {
            status,
            headers,
            body: bytes,
        })
    }
}

/// First upstream request id found in `headers`, for correlating logs with
/// the provider's side.
pub fn upstream_request_id(headers: &HeaderMap) -> Option<&str> {
    REQUEST_ID_HEADERS
        .iter()
        .find_map(|name| headers.get(*name)?.to_str().ok())
}
