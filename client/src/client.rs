use crate::{events::Stream, Error, Result};
use reqwest::{Client as HttpClient, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::connect_async;
use tracing::{debug, info};
use url::Url;
use wheelspin_types::{
    api::{
        ClaimRequest, ErrorResponse, GrantRequest, Health, SetLimitRequest, SpinRequest,
        SpinResponse, TemplateQuery, Update,
    },
    HistoryEntry, HistoryFilter, PrizeProbability, SpinBudget, SpinPolicyConfig, Stats,
};

/// Timeout for connections and requests
const TIMEOUT: Duration = Duration::from_secs(30);

/// Retry policy for transient HTTP failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per request (including the first attempt).
    pub max_attempts: usize,
    /// Initial backoff delay after the first retryable failure.
    pub initial_backoff: Duration,
    /// Maximum backoff delay between attempts.
    pub max_backoff: Duration,
    /// Whether non-idempotent requests may be retried. Spins that carry a
    /// request id are always considered idempotent.
    pub retry_non_idempotent: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(2),
            retry_non_idempotent: false,
        }
    }
}

/// Wheelspin API client
#[derive(Clone)]
pub struct Client {
    pub base_url: Url,
    pub ws_url: Url,
    pub http_client: HttpClient,

    retry_policy: RetryPolicy,
}

impl Client {
    /// Create a new client
    pub fn new(base_url: &str) -> Result<Self> {
        let base_url = Url::parse(base_url)?;

        // Convert http(s) to ws(s) for WebSocket URL
        let ws_scheme = match base_url.scheme() {
            "http" => "ws",
            "https" => "wss",
            scheme => {
                return Err(Error::InvalidScheme(scheme.to_string()));
            }
        };

        let mut ws_url = base_url.clone();
        ws_url
            .set_scheme(ws_scheme)
            .map_err(|_| Error::InvalidScheme(ws_scheme.to_string()))?;

        let http_client = HttpClient::builder()
            .timeout(TIMEOUT)
            .pool_idle_timeout(Duration::from_secs(60))
            .tcp_keepalive(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            base_url,
            ws_url,
            http_client,
            retry_policy: RetryPolicy::default(),
        })
    }

    /// Returns a copy of the current retry policy.
    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry_policy
    }

    /// Sets the retry policy for subsequent HTTP requests.
    pub fn set_retry_policy(&mut self, retry_policy: RetryPolicy) {
        self.retry_policy = retry_policy;
    }

    /// Returns a new client with the provided retry policy.
    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// `base` with `segments` appended as escaped path segments.
    fn endpoint(base: &Url, segments: &[&str]) -> Result<Url> {
        let mut url = base.clone();
        url.path_segments_mut()
            .map_err(|_| Error::InvalidScheme(base.scheme().to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn send_with_retry(
        &self,
        idempotent: bool,
        make_request: impl Fn() -> RequestBuilder,
    ) -> Result<Response> {
        let max_attempts = if idempotent || self.retry_policy.retry_non_idempotent {
            self.retry_policy.max_attempts.max(1)
        } else {
            1
        };

        let mut attempt = 0usize;
        let mut backoff = self.retry_policy.initial_backoff;
        loop {
            attempt += 1;
            let result = make_request().send().await;
            match result {
                Ok(response) => {
                    let status = response.status();
                    if !is_retryable_status(status) || attempt >= max_attempts {
                        return Ok(response);
                    }
                    debug!(%status, attempt, "retrying request");
                }
                Err(err) => {
                    if attempt >= max_attempts || !is_retryable_error(&err) {
                        return Err(Error::Reqwest(err));
                    }
                    debug!(?err, attempt, "retrying request");
                }
            }

            if backoff > Duration::ZERO {
                sleep(backoff).await;
                backoff = std::cmp::min(backoff.saturating_mul(2), self.retry_policy.max_backoff);
            }
        }
    }

    async fn get<T: DeserializeOwned>(&self, url: Url) -> Result<T> {
        let response = self
            .send_with_retry(true, || self.http_client.get(url.clone()))
            .await?;
        decode(response).await
    }

    /// `GET` that maps `404` to `None`.
    async fn get_optional<T: DeserializeOwned>(&self, url: Url) -> Result<Option<T>> {
        let response = self
            .send_with_retry(true, || self.http_client.get(url.clone()))
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        decode(response).await.map(Some)
    }

    async fn send_json<B, T>(
        &self,
        method: Method,
        url: Url,
        body: &B,
        idempotent: bool,
    ) -> Result<T>
    where
        B: serde::Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let response = self
            .send_with_retry(idempotent, || {
                self.http_client
                    .request(method.clone(), url.clone())
                    .json(body)
            })
            .await?;
        decode(response).await
    }

    /// Spin the wheel. Retried under the retry policy only when the request
    /// carries a request id.
    pub async fn spin(&self, request: &SpinRequest) -> Result<SpinResponse> {
        let url = Self::endpoint(&self.base_url, &["spin"])?;
        debug!(session_id = %request.session_id, template = %request.template, "Spinning");
        let idempotent = request.request_id.is_some();
        self.send_json(Method::POST, url, request, idempotent).await
    }

    /// Claim the prize of spin `entry_id`. Returns the stamped spin entry.
    pub async fn claim(&self, entry_id: u64, session_id: &str) -> Result<HistoryEntry> {
        let url = Self::endpoint(&self.base_url, &["claim"])?;
        let request = ClaimRequest {
            entry_id,
            session_id: session_id.to_string(),
        };
        self.send_json(Method::POST, url, &request, false).await
    }

    pub async fn get_limit(&self, player_id: &str, template: Option<&str>) -> Result<SpinBudget> {
        let mut url = Self::endpoint(&self.base_url, &["players", player_id, "limit"])?;
        if let Some(template) = template {
            url.query_pairs_mut().append_pair("template", template);
        }
        self.get(url).await
    }

    pub async fn set_limit(
        &self,
        player_id: &str,
        max_spins: Option<u32>,
        template: Option<&str>,
    ) -> Result<SpinBudget> {
        let url = Self::endpoint(&self.base_url, &["players", player_id, "limit"])?;
        let request = SetLimitRequest {
            max_spins,
            template: template.map(str::to_string),
        };
        self.send_json(Method::PUT, url, &request, true).await
    }

    pub async fn grant(
        &self,
        player_id: &str,
        additional: u32,
        template: Option<&str>,
    ) -> Result<SpinBudget> {
        let url = Self::endpoint(&self.base_url, &["players", player_id, "grant"])?;
        let request = GrantRequest {
            additional,
            template: template.map(str::to_string),
        };
        self.send_json(Method::POST, url, &request, false).await
    }

    /// History entries matching `filter`, most recent first.
    pub async fn history(&self, filter: &HistoryFilter) -> Result<Vec<HistoryEntry>> {
        let mut url = Self::endpoint(&self.base_url, &["history"])?;
        append_filter(&mut url, filter);
        self.get(url).await
    }

    pub async fn stats(&self, template: Option<&str>) -> Result<Stats> {
        let url = Self::endpoint(&self.base_url, &["stats"])?;
        let query = TemplateQuery {
            template: template.map(str::to_string),
        };
        let response = self
            .send_with_retry(true, || self.http_client.get(url.clone()).query(&query))
            .await?;
        decode(response).await
    }

    /// Ids of all configured templates, sorted.
    pub async fn templates(&self) -> Result<Vec<String>> {
        self.get(Self::endpoint(&self.base_url, &["templates"])?)
            .await
    }

    pub async fn template(&self, template: &str) -> Result<Option<SpinPolicyConfig>> {
        self.get_optional(Self::endpoint(&self.base_url, &["templates", template])?)
            .await
    }

    /// Store a template. Returns the config as the server normalized it.
    pub async fn put_template(
        &self,
        template: &str,
        config: &SpinPolicyConfig,
    ) -> Result<SpinPolicyConfig> {
        let url = Self::endpoint(&self.base_url, &["templates", template])?;
        self.send_json(Method::PUT, url, config, true).await
    }

    pub async fn probabilities(&self, template: &str) -> Result<Option<Vec<PrizeProbability>>> {
        let url = Self::endpoint(&self.base_url, &["templates", template, "probabilities"])?;
        self.get_optional(url).await
    }

    pub async fn health(&self) -> Result<Health> {
        self.get(Self::endpoint(&self.base_url, &["health"])?)
            .await
    }

    /// Connect to the updates stream with the specified filter
    pub async fn connect_updates(&self, filter: &HistoryFilter) -> Result<Stream<Update>> {
        self.connect_updates_with_capacity(filter, 0).await
    }

    /// Connect to the updates stream with a configurable channel capacity.
    ///
    /// A `channel_capacity` of `0` uses the default capacity.
    pub async fn connect_updates_with_capacity(
        &self,
        filter: &HistoryFilter,
        channel_capacity: usize,
    ) -> Result<Stream<Update>> {
        let mut ws_url = Self::endpoint(&self.ws_url, &["updates"])?;
        append_filter(&mut ws_url, filter);
        info!(ws_url = %ws_url, ?filter, "Connecting to updates WebSocket");

        let (ws_stream, _) = timeout(TIMEOUT, connect_async(ws_url.as_str()))
            .await
            .map_err(|_| Error::DialTimeout)??;
        info!("WebSocket connected");

        Ok(Stream::new(ws_stream, channel_capacity))
    }
}

fn append_filter(url: &mut Url, filter: &HistoryFilter) {
    let mut pairs = url.query_pairs_mut();
    if let Some(session_id) = &filter.session_id {
        pairs.append_pair("sessionId", session_id);
    }
    if let Some(template) = &filter.template {
        pairs.append_pair("template", template);
    }
    if let Some(limit) = filter.limit {
        pairs.append_pair("limit", &limit.to_string());
    }
    drop(pairs);
    if url.query() == Some("") {
        url.set_query(None);
    }
}

/// Parse a success body, or turn an error body into [Error::Api].
async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json().await?);
    }
    let body = response.bytes().await?;
    match serde_json::from_slice::<ErrorResponse>(&body) {
        Ok(error) => Err(Error::Api {
            status,
            code: error.error,
            message: error.message,
        }),
        Err(_) => Err(Error::Failed(status)),
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::REQUEST_TIMEOUT
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_connect() || err.is_timeout()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ws_url_and_scheme() {
        let client = Client::new("http://localhost:8080").unwrap();
        assert_eq!(client.ws_url.as_str(), "ws://localhost:8080/");
        let client = Client::new("https://wheel.example.com/api/").unwrap();
        assert_eq!(client.ws_url.scheme(), "wss");

        assert!(matches!(
            Client::new("ftp://localhost"),
            Err(Error::InvalidScheme(scheme)) if scheme == "ftp"
        ));
        assert!(matches!(Client::new("not a url"), Err(Error::Url(_))));
    }

    #[test]
    fn test_endpoint_escapes_segments() {
        let base = Url::parse("https://wheel.example.com/api/").unwrap();
        let url = Client::endpoint(&base, &["players", "a b/c", "limit"]).unwrap();
        assert_eq!(
            url.as_str(),
            "https://wheel.example.com/api/players/a%20b%2Fc/limit"
        );
    }

    #[test]
    fn test_filter_query() {
        let mut url = Url::parse("http://localhost/history").unwrap();
        append_filter(&mut url, &HistoryFilter::default());
        assert_eq!(url.as_str(), "http://localhost/history");

        let filter = HistoryFilter {
            session_id: Some("s1".to_string()),
            template: None,
            limit: Some(10),
        };
        append_filter(&mut url, &filter);
        assert_eq!(url.query(), Some("sessionId=s1&limit=10"));
    }

    #[test]
    fn test_retry_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 1);
        assert!(!policy.retry_non_idempotent);

        let retrying = RetryPolicy {
            max_attempts: 3,
            ..policy
        };
        let client = Client::new("http://localhost").unwrap().with_retry_policy(retrying);
        assert_eq!(client.retry_policy(), retrying);

        assert!(is_retryable_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(!is_retryable_status(StatusCode::FORBIDDEN));
    }
}
