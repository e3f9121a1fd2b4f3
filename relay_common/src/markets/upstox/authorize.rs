//! # Feed Authorization
//!
//! Exchanges an access token for the single-use WebSocket URI of the market
//! data feed.

use serde::Deserialize;
use thiserror::Error;

use crate::retrieve::ApiClient;

/// V3 authorize endpoint.
pub const DEFAULT_AUTHORIZE_URL: &str =
    "https://api.upstox.com/v3/feed/market-data-feed/authorize";

/// Why the feed URI could not be obtained.
#[derive(Debug, Error)]
pub enum AuthorizeError {
    /// The access token is empty.
    #[error("no access token configured")]
    MissingToken,
    /// The authorize URL does not parse.
    #[error("invalid authorize URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    /// Transport failure after retries.
    #[error("authorize request failed: {0}")]
    Request(#[source] anyhow::Error),
    /// Non-success HTTP status.
    #[error("authorize rejected: {0}")]
    Rejected(String),
    /// Success status but no `authorizedRedirectUri` in the body.
    #[error("authorize response carried no redirect URI")]
    MissingUri,
}

#[derive(Debug, Deserialize)]
struct AuthorizeResponse {
    data: Option<AuthorizeData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthorizeData {
    authorized_redirect_uri: Option<String>,
}

/// Calls the authorize endpoint and returns the `wss://` URI to connect to.
pub async fn authorize(access_token: &str, authorize_url: &str) -> Result<String, AuthorizeError> {
    if access_token.trim().is_empty() {
        return Err(AuthorizeError::MissingToken);
    }

    let client = ApiClient::new(authorize_url, Some(access_token.to_string()))?;
    let resp = client
        .get::<AuthorizeResponse>("")
        .await
        .map_err(AuthorizeError::Request)?;

    if !resp.success {
        return Err(AuthorizeError::Rejected(resp.failure_summary()));
    }

    let uri = resp
        .data
        .and_then(|body| body.data)
        .and_then(|data| data.authorized_redirect_uri)
        .filter(|uri| !uri.is_empty())
        .ok_or(AuthorizeError::MissingUri)?;

    log::info!("Market data feed authorized.");
    Ok(uri)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_authorize_body() {
        let body = r#"{"status":"success","data":{"authorizedRedirectUri":"wss://feed.example/ws?code=abc"}}"#;
        let parsed: AuthorizeResponse = serde_json::from_str(body).unwrap();
        assert_eq!(
            parsed.data.unwrap().authorized_redirect_uri.as_deref(),
            Some("wss://feed.example/ws?code=abc")
        );
    }

    #[tokio::test]
    async fn test_blank_token_fails_before_any_request() {
        let err = authorize("  ", DEFAULT_AUTHORIZE_URL).await.unwrap_err();
        assert!(matches!(err, AuthorizeError::MissingToken));
    }

    #[tokio::test]
    async fn test_relative_url_is_rejected() {
        let err = authorize("token", "/authorize").await.unwrap_err();
        assert!(matches!(err, AuthorizeError::InvalidUrl(_)));
    }
}
