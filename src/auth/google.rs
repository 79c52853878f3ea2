use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::AuthError;
use crate::config::OAuthConfig;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: String,
    pub email: Option<String>,
    pub name: Option<String>,
    pub picture: Option<String>,
}

/// Exchanges an OAuth authorization code for the caller's profile.
#[async_trait]
pub trait IdentityProvider: Send + Sync + std::fmt::Debug {
    async fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<UserProfile, AuthError>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct UserInfo {
    sub: String,
    email: Option<String>,
    name: Option<String>,
    picture: Option<String>,
}

#[derive(Clone)]
pub struct GoogleIdentityProvider {
    http: reqwest::Client,
    config: OAuthConfig,
}

impl std::fmt::Debug for GoogleIdentityProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GoogleIdentityProvider")
            .field("client_id", &self.config.client_id)
            .field("token_url", &self.config.token_url)
            .finish_non_exhaustive()
    }
}

impl GoogleIdentityProvider {
    pub fn new(config: OAuthConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }
}

#[async_trait]
impl IdentityProvider for GoogleIdentityProvider {
    async fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<UserProfile, AuthError> {
        if self.config.client_id.is_empty() {
            return Err(AuthError::NotConfigured);
        }

        let resp = self
            .http
            .post(&self.config.token_url)
            .form(&[
                ("code", code),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
                ("redirect_uri", redirect_uri),
                ("grant_type", "authorization_code"),
            ])
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(AuthError::Provider(format!("token exchange {status}: {body}")));
        }
        let token: TokenResponse = resp.json().await?;

        let resp = self
            .http
            .get(&self.config.userinfo_url)
            .bearer_auth(&token.access_token)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(AuthError::Provider(format!("userinfo {}", resp.status())));
        }
        let info: UserInfo = resp.json().await?;
        debug!(user_id = %info.sub, "Identity resolved");

        Ok(UserProfile {
            id: info.sub,
            email: info.email,
            name: info.name,
            picture: info.picture,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::{get, post};
    use axum::{Form, Json, Router};
    use std::collections::HashMap;

    async fn fake_google() -> String {
        let app = Router::new()
            .route(
                "/token",
                post(|Form(form): Form<HashMap<String, String>>| async move {
                    if form.get("code").map(String::as_str) == Some("good") {
                        Ok(Json(serde_json::json!({ "access_token": "at-1" })))
                    } else {
                        Err(axum::http::StatusCode::BAD_REQUEST)
                    }
                }),
            )
            .route(
                "/userinfo",
                get(|| async {
                    Json(serde_json::json!({
                        "sub": "google-42",
                        "email": "ada@example.com",
                        "name": "Ada"
                    }))
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn provider(base: &str) -> GoogleIdentityProvider {
        GoogleIdentityProvider::new(OAuthConfig {
            client_id: "client".into(),
            client_secret: "secret".into(),
            token_url: format!("{base}/token"),
            userinfo_url: format!("{base}/userinfo"),
        })
    }

    #[tokio::test]
    async fn test_exchange_code() {
        let base = fake_google().await;
        let profile = provider(&base)
            .exchange_code("good", "http://localhost/cb")
            .await
            .unwrap();
        assert_eq!(profile.id, "google-42");
        assert_eq!(profile.email.as_deref(), Some("ada@example.com"));
        assert_eq!(profile.picture, None);
    }

    #[tokio::test]
    async fn test_rejected_code() {
        let base = fake_google().await;
        let err = provider(&base)
            .exchange_code("bad", "http://localhost/cb")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Provider(_)));
    }

    #[tokio::test]
    async fn test_unconfigured_client() {
        let p = GoogleIdentityProvider::new(OAuthConfig::default());
        assert!(matches!(
            p.exchange_code("good", "x").await,
            Err(AuthError::NotConfigured)
        ));
    }
}
