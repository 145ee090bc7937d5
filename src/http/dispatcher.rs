//! Pooled GET dispatch
//!
//! Every call runs exactly one exchange on a connection borrowed from the
//! shared [`ConnectionPool`]:
//! - the request is built (query string encoded, headers attached)
//! - a connection is acquired, within the pool's acquire timeout
//! - the response head and the whole body are read, each within the read timeout
//! - the connection goes back to the pool, or is closed when anything went wrong
//!
//! [`HttpClient::try_get`] reports what went wrong; [`HttpClient::execute_get`]
//! logs it and collapses every failure to `None`.

use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, HOST, USER_AGENT};
use hyper::{Method, Request, StatusCode, Version};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info};
use url::Url;

use super::query::{self, QueryError};
use crate::pool::{ConnectionPool, PoolError, PooledConnection, Route};

/// Dispatch errors
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("No URL given")]
    EmptyUrl,

    #[error("Invalid URL {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    #[error("Query encoding error: {0}")]
    Query(#[from] QueryError),

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::http::Error),

    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Connection closed before the request was sent")]
    ConnectionClosed,

    #[error("Request failed: {0}")]
    Request(#[source] hyper::Error),

    #[error("No response within {0:?}")]
    ReadTimeout(Duration),

    #[error("Body error: {0}")]
    Body(#[source] hyper::Error),

    #[error("Unexpected status: {status}")]
    Status { status: StatusCode, body: String },
}

/// A fully buffered response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: StatusCode,
    pub body: String,
}

/// Per-request settings shared by every call of a client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Budget for the response head, and again for the body
    pub read_timeout: Duration,

    /// Sent unless the caller supplies its own User-Agent
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_millis(5_000),
            user_agent: concat!("getpool/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// GET client over a shared connection pool
///
/// Clone is cheap; clones share the same pool.
#[derive(Clone)]
pub struct HttpClient {
    pool: ConnectionPool,
    config: Arc<ClientConfig>,
}

impl HttpClient {
    pub fn new(pool: ConnectionPool, config: ClientConfig) -> Self {
        Self {
            pool,
            config: Arc::new(config),
        }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Issue a GET and return the body when the status is exactly 200
    ///
    /// An absent or empty URL returns `None` without any I/O. Every other
    /// failure (invalid URL, pool exhaustion, transport error, timeout,
    /// non-200 status) is logged with the URL and also yields `None`.
    pub async fn execute_get(
        &self,
        url: Option<&str>,
        query_params: Option<&BTreeMap<String, String>>,
        headers: Option<&BTreeMap<String, String>>,
    ) -> Option<String> {
        let url = non_empty(url)?;

        let target = match build_target(url, query_params) {
            Ok(target) => target,
            Err(e) => {
                error!(url = %url, error = %e, "GET request could not be built");
                return None;
            }
        };

        match self.dispatch(&target, headers).await {
            Ok(response) => Some(response.body),
            Err(DispatchError::Status { status, body }) => {
                info!(
                    url = %target,
                    status = status.as_u16(),
                    body_len = body.len(),
                    "GET returned non-success status"
                );
                None
            }
            Err(e) => {
                error!(url = %target, error = %e, "GET request failed");
                None
            }
        }
    }

    /// Issue a GET and report the outcome in full
    ///
    /// A non-200 response is returned as [`DispatchError::Status`] with its
    /// drained body.
    pub async fn try_get(
        &self,
        url: Option<&str>,
        query_params: Option<&BTreeMap<String, String>>,
        headers: Option<&BTreeMap<String, String>>,
    ) -> Result<Response, DispatchError> {
        let url = non_empty(url).ok_or(DispatchError::EmptyUrl)?;
        let target = build_target(url, query_params)?;
        self.dispatch(&target, headers).await
    }

    async fn dispatch(
        &self,
        target: &Url,
        headers: Option<&BTreeMap<String, String>>,
    ) -> Result<Response, DispatchError> {
        let route = Route::from_url(target)?;
        let request = self.build_request(target, &route, headers)?;

        let start = Instant::now();
        let mut conn = self.pool.acquire(&route).await?;
        let outcome = self.exchange(&mut conn, request).await;

        // Only a connection whose response was read to the end, and that the
        // server keeps open, may be reused
        let reusable = matches!(outcome, Ok((_, true)));
        self.pool.release(conn, reusable);

        let (response, _) = outcome?;
        debug!(
            url = %target,
            status = response.status.as_u16(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "GET completed"
        );

        if response.status != StatusCode::OK {
            return Err(DispatchError::Status {
                status: response.status,
                body: response.body,
            });
        }

        Ok(response)
    }

    fn build_request(
        &self,
        target: &Url,
        route: &Route,
        headers: Option<&BTreeMap<String, String>>,
    ) -> Result<Request<Empty<Bytes>>, DispatchError> {
        let path_and_query = match target.query() {
            Some(query) => format!("{}?{}", target.path(), query),
            None => target.path().to_string(),
        };

        let mut request = Request::builder()
            .method(Method::GET)
            .uri(path_and_query)
            .body(Empty::new())?;

        let request_headers = request.headers_mut();
        request_headers.insert(HOST, header_value("host", &route.host_header())?);

        if let Some(headers) = headers {
            for (key, value) in headers {
                let name = HeaderName::from_bytes(key.as_bytes())
                    .map_err(|_| DispatchError::InvalidHeader(key.clone()))?;
                request_headers.insert(name, header_value(key, value)?);
            }
        }

        if !request_headers.contains_key(USER_AGENT) {
            request_headers.insert(USER_AGENT, header_value("user-agent", &self.config.user_agent)?);
        }

        Ok(request)
    }

    async fn exchange(
        &self,
        conn: &mut PooledConnection,
        request: Request<Empty<Bytes>>,
    ) -> Result<(Response, bool), DispatchError> {
        let read_timeout = self.config.read_timeout;
        let reused = conn.is_reused();
        let sender = conn.sender().ok_or(DispatchError::ConnectionClosed)?;

        // A reused connection may still be settling after its previous exchange
        tokio::time::timeout(read_timeout, sender.ready())
            .await
            .map_err(|_| DispatchError::ReadTimeout(read_timeout))?
            .map_err(|_| DispatchError::ConnectionClosed)?;

        debug!(uri = %request.uri(), reused, "GET sent");

        let response = tokio::time::timeout(read_timeout, sender.send_request(request))
            .await
            .map_err(|_| DispatchError::ReadTimeout(read_timeout))?
            .map_err(DispatchError::Request)?;

        let status = response.status();
        let keep_alive = keeps_alive(response.version(), response.headers());
        let body = tokio::time::timeout(read_timeout, response.into_body().collect())
            .await
            .map_err(|_| DispatchError::ReadTimeout(read_timeout))?
            .map_err(DispatchError::Body)?
            .to_bytes();

        let response = Response {
            status,
            body: String::from_utf8_lossy(&body).into_owned(),
        };
        Ok((response, keep_alive))
    }
}

fn non_empty(url: Option<&str>) -> Option<&str> {
    url.map(str::trim).filter(|u| !u.is_empty())
}

/// Parse the URL and append the encoded parameters to its query
fn build_target(
    url: &str,
    query_params: Option<&BTreeMap<String, String>>,
) -> Result<Url, DispatchError> {
    let mut target = Url::parse(url).map_err(|e| DispatchError::InvalidUrl {
        url: url.to_string(),
        source: e,
    })?;

    if let Some(params) = query_params.filter(|p| !p.is_empty()) {
        let encoded = query::encode(params, "UTF-8")?;
        let query = match target.query() {
            Some(existing) if !existing.is_empty() => format!("{}&{}", existing, encoded),
            _ => encoded,
        };
        target.set_query(Some(&query));
    }

    Ok(target)
}

/// Whether the server leaves the connection open after this response
///
/// HTTP/1.1 is persistent unless `Connection: close`; HTTP/1.0 only with
/// `Connection: keep-alive`.
fn keeps_alive(version: Version, headers: &HeaderMap) -> bool {
    let has_token = |token: &str| {
        headers
            .get_all(CONNECTION)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    };

    match version {
        Version::HTTP_10 | Version::HTTP_09 => has_token("keep-alive"),
        _ => !has_token("close"),
    }
}

fn header_value(name: &str, value: &str) -> Result<HeaderValue, DispatchError> {
    HeaderValue::from_str(value).map_err(|_| DispatchError::InvalidHeader(name.to_string()))
}
