use crate::model::{Credential, Token, TokenResponse};
use chrono::{Duration, Utc};
use listings_core::{Error, Result};
use metrics::counter;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Owns the client-credentials exchange and the currently held bearer token.
///
/// The held token sits behind one async mutex that stays locked for the whole
/// exchange. Workers that find the token expired queue on that lock and then
/// reuse the fresh token instead of starting their own exchange.
pub struct TokenManager {
    http: reqwest::Client,
    token_url: String,
    credential: Credential,
    expiry_margin: Duration,
    current: Mutex<Option<Token>>,
}

impl TokenManager {
    pub fn new(
        http: reqwest::Client,
        token_url: impl Into<String>,
        credential: Credential,
        expiry_margin: Duration,
    ) -> Self {
        Self {
            http,
            token_url: token_url.into(),
            credential,
            expiry_margin,
            current: Mutex::new(None),
        }
    }

    /// Returns a token that is valid right now, exchanging credentials if needed.
    ///
    /// A failed exchange leaves the previously held token in place.
    pub async fn ensure_valid_token(&self) -> Result<Token> {
        let mut current = self.current.lock().await;

        if let Some(token) = current.as_ref() {
            if token.is_usable_at(Utc::now(), self.expiry_margin) {
                return Ok(token.clone());
            }
            info!(expired_at = %token.expires_at, "Access token expired, refreshing");
        }

        let token = self.exchange().await?;
        *current = Some(token.clone());
        Ok(token)
    }

    async fn exchange(&self) -> Result<Token> {
        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", self.credential.client_id.as_str()),
            ("client_secret", self.credential.client_secret.as_str()),
        ];

        let response = self.http.post(&self.token_url).form(&form).send().await?;
        let status = response.status();
        counter!("ingester_token_exchanges", "status" => status.as_u16().to_string()).increment(1);

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), body = %body, "Failed to retrieve access token");
            return Err(Error::Auth {
                status: status.as_u16(),
                body,
            });
        }

        let body = response.text().await?;
        let payload: TokenResponse = serde_json::from_str(&body)?;
        let issued_at = Utc::now();
        let expires_at = Duration::try_seconds(payload.expires_in)
            .and_then(|lifetime| issued_at.checked_add_signed(lifetime))
            .ok_or_else(|| Error::Auth {
                status: status.as_u16(),
                body: format!("token lifetime out of range: expires_in={}", payload.expires_in),
            })?;

        debug!(%expires_at, "Fetched access token");

        Ok(Token {
            access_token: payload.access_token,
            issued_at,
            expires_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn manager(server: &MockServer, margin: Duration) -> TokenManager {
        TokenManager::new(
            reqwest::Client::new(),
            format!("{}/oauth2/token", server.uri()),
            Credential::new("client-id", "client-secret"),
            margin,
        )
    }

    fn token_body(token: &str, expires_in: i64) -> serde_json::Value {
        serde_json::json!({
            "token_type": "Bearer",
            "access_token": token,
            "expires_in": expires_in,
        })
    }

    #[tokio::test]
    async fn reuses_token_until_expiry() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth2/token"))
            .and(body_string_contains("grant_type=client_credentials"))
            .and(body_string_contains("client_id=client-id"))
            .and(body_string_contains("client_secret=client-secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body("abc", 3600)))
            .expect(1)
            .mount(&server)
            .await;

        let tokens = manager(&server, Duration::zero());
        for _ in 0..5 {
            let token = tokens.ensure_valid_token().await.expect("token");
            assert_eq!(token.access_token, "abc");
        }
    }

    #[tokio::test]
    async fn refreshes_expired_token_once_for_concurrent_callers() {
        let server = MockServer::start().await;
        // a zero lifetime leaves the held token already expired
        Mock::given(method("POST"))
            .and(path("/oauth2/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body("stale", 0)))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;

        let tokens = Arc::new(manager(&server, Duration::seconds(60)));
        tokens.ensure_valid_token().await.expect("first token");

        Mock::given(method("POST"))
            .and(path("/oauth2/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body("fresh", 3600)))
            .expect(1)
            .mount(&server)
            .await;

        let callers = (0..8).map(|_| {
            let tokens = Arc::clone(&tokens);
            async move { tokens.ensure_valid_token().await }
        });
        let results = futures::future::join_all(callers).await;

        for result in results {
            assert_eq!(result.expect("token").access_token, "fresh");
        }
    }

    #[tokio::test]
    async fn failed_exchange_reports_status_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth2/token"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid_client"))
            .mount(&server)
            .await;

        let err = manager(&server, Duration::zero())
            .ensure_valid_token()
            .await
            .expect_err("exchange should fail");

        match err {
            Error::Auth { status, body } => {
                assert_eq!(status, 401);
                assert_eq!(body, "invalid_client");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn failed_refresh_keeps_previous_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth2/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body("old", 0)))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/oauth2/token"))
            .respond_with(ResponseTemplate::new(503).set_body_string("down"))
            .mount(&server)
            .await;

        let tokens = manager(&server, Duration::seconds(30));
        tokens.ensure_valid_token().await.expect("first token");

        let err = tokens.ensure_valid_token().await.expect_err("refresh fails");
        assert!(matches!(err, Error::Auth { status: 503, .. }));

        let held = tokens.current.lock().await.clone().expect("token retained");
        assert_eq!(held.access_token, "old");
    }

    #[tokio::test]
    async fn short_lived_token_is_reused_despite_larger_margin() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth2/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body("short", 20)))
            .expect(1)
            .mount(&server)
            .await;

        let tokens = manager(&server, Duration::seconds(30));
        for _ in 0..5 {
            let token = tokens.ensure_valid_token().await.expect("token");
            assert_eq!(token.access_token, "short");
        }
    }

    #[tokio::test]
    async fn out_of_range_lifetime_is_an_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth2/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body("forever", i64::MAX)))
            .mount(&server)
            .await;

        let tokens = manager(&server, Duration::zero());
        let err = tokens.ensure_valid_token().await.expect_err("lifetime overflows");

        match err {
            Error::Auth { status, body } => {
                assert_eq!(status, 200);
                assert!(body.contains("expires_in"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(tokens.current.lock().await.is_none());
    }
}
