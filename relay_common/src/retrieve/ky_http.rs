//! # HTTP Retrieval Utilities
//!
//! An asynchronous API client wrapper around `reqwest` with exponential
//! backoff on transient failures and uniform JSON response handling.

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Method;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::{de::DeserializeOwned, Serialize};
use url::Url;

/// Retries applied to transient failures (connect errors, 5xx, 429).
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Outcome of one request, successful or not.
#[derive(Debug)]
pub struct ApiResponse<T> {
    /// Deserialized body on a 2xx response.
    pub data: Option<T>,
    /// Raw body of a non-2xx response.
    pub error_body: Option<String>,
    /// Numeric HTTP status code.
    pub status: u16,
    /// Whether the status was in the 2xx range.
    pub success: bool,
    /// Response headers.
    pub headers: HeaderMap,
}

impl<T> ApiResponse<T> {
    /// Short description of a failed response for logs and error values.
    pub fn failure_summary(&self) -> String {
        match &self.error_body {
            Some(body) if !body.is_empty() => format!("HTTP {}: {}", self.status, body),
            _ => format!("HTTP {}", self.status),
        }
    }
}

/// HTTP client bound to a base URL and an optional bearer token.
pub struct ApiClient {
    inner: ClientWithMiddleware,
    base_url: Url,
    auth_token: Option<String>,
}

impl ApiClient {
    /// Creates a client with the default retry budget.
    ///
    /// # Errors
    /// Fails when `base_url` is not an absolute URL.
    pub fn new(base_url: &str, auth_token: Option<String>) -> Result<Self, url::ParseError> {
        Self::with_max_retries(base_url, auth_token, DEFAULT_MAX_RETRIES)
    }

    /// Creates a client that retries transient failures up to `max_retries` times.
    pub fn with_max_retries(
        base_url: &str,
        auth_token: Option<String>,
        max_retries: u32,
    ) -> Result<Self, url::ParseError> {
        let base_url = Url::parse(base_url)?;
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(max_retries);
        let inner = ClientBuilder::new(reqwest::Client::new())
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Ok(Self {
            inner,
            base_url,
            auth_token,
        })
    }

    /// The base URL relative paths are joined onto.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Resolves `path` against the base URL. An empty path targets the base itself.
    pub fn resolve(&self, path: &str) -> Result<Url, url::ParseError> {
        if path.is_empty() {
            Ok(self.base_url.clone())
        } else {
            self.base_url.join(path)
        }
    }

    /// `GET` with no body.
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> anyhow::Result<ApiResponse<T>> {
        self.request::<T, ()>(Method::GET, path, None, None).await
    }

    /// Performs a request, attaching the bearer token and a JSON body when given.
    ///
    /// Non-2xx responses are returned as `Ok` with `success == false`; only
    /// transport, URL and body decoding failures are errors.
    pub async fn request<T, B>(
        &self,
        method: Method,
        path: &str,
        headers: Option<HeaderMap>,
        body: Option<B>,
    ) -> anyhow::Result<ApiResponse<T>>
    where
        T: DeserializeOwned,
        B: Serialize,
    {
        let full_url = self.resolve(path)?;
        let mut req = self
            .inner
            .request(method, full_url)
            .header(ACCEPT, HeaderValue::from_static("application/json"));

        if let Some(h) = headers {
            req = req.headers(h);
        }
        if let Some(token) = &self.auth_token {
            req = req.header(AUTHORIZATION, format!("Bearer {}", token));
        }
        if let Some(b) = body {
            req = req
                .header(CONTENT_TYPE, "application/json")
                .body(serde_json::to_string(&b)?);
        }

        let response: reqwest::Response = req.send().await?;
        let status = response.status();
        let headers = response.headers().clone();

        if status.is_success() {
            let data = response.json::<T>().await?;
            Ok(ApiResponse {
                data: Some(data),
                error_body: None,
                status: status.as_u16(),
                success: true,
                headers,
            })
        } else {
            let error_body = response.text().await.ok();
            Ok(ApiResponse {
                data: None,
                error_body,
                status: status.as_u16(),
                success: false,
                headers,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_relative_base_url() {
        assert!(ApiClient::new("/v3/feed", None).is_err());
    }

    #[test]
    fn test_resolve_empty_path_targets_base() {
        let client = ApiClient::new(
            "https://api.upstox.com/v3/feed/market-data-feed/authorize",
            Some("token".into()),
        )
        .unwrap();
        assert_eq!(client.resolve("").unwrap(), *client.base_url());
        assert_eq!(
            client.resolve("status").unwrap().as_str(),
            "https://api.upstox.com/v3/feed/market-data-feed/status"
        );
    }

    #[test]
    fn test_failure_summary() {
        let resp: ApiResponse<()> = ApiResponse {
            data: None,
            error_body: Some("{\"status\":\"error\"}".into()),
            status: 401,
            success: false,
            headers: HeaderMap::new(),
        };
        assert_eq!(resp.failure_summary(), "HTTP 401: {\"status\":\"error\"}");
    }
}
