use crate::shutdown::{self, ShutdownRx};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::sleep;

/// Username sentinel the broker uses to route a connection through JWT
/// authentication; the password slot carries the access token.
pub const AUTH_USERNAME: &str = "JWT";

/// Password presented when no token could be obtained. The broker treats
/// such connections as anonymous devices.
pub const FALLBACK_PASSWORD: &str = "mqtt";

pub const MAX_RETRIES: u32 = 5;
pub const BACKOFF_BASE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub uri: String,
    pub client_id: String,
    pub client_secret: String,
    pub audience: String,
}

impl AuthConfig {
    pub fn token_url(&self) -> String {
        let base = self.uri.trim_end_matches('/');
        if base.starts_with("http://") || base.starts_with("https://") {
            format!("{base}/oauth/token")
        } else {
            format!("https://{base}/oauth/token")
        }
    }
}

/// Bearer credential issued by the token endpoint. Immutable; each
/// renewal publishes a fresh value through the credential watch cell.
#[derive(Debug, Clone)]
pub struct Credential {
    pub token_type: String,
    pub access_token: String,
    pub expires_in: Option<Duration>,
}

impl Credential {
    pub fn fallback() -> Self {
        Self {
            token_type: "Bearer".to_string(),
            access_token: FALLBACK_PASSWORD.to_string(),
            expires_in: None,
        }
    }

    pub fn mqtt_password(&self) -> &str {
        &self.access_token
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("token endpoint unavailable after {attempts} attempts: {last}")]
    Unavailable { attempts: u32, last: String },
}

#[derive(Serialize)]
struct TokenRequest<'a> {
    client_id: &'a str,
    client_secret: &'a str,
    audience: &'a str,
    grant_type: &'a str,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    token_type: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// Delay before retry `attempt` (1-based): `base * sqrt(attempt)`.
/// Monotonically increasing, sub-linear.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.mul_f64((attempt.max(1) as f64).sqrt())
}

async fn request_token(client: &Client, auth: &AuthConfig) -> anyhow::Result<Credential> {
    let body = TokenRequest {
        client_id: &auth.client_id,
        client_secret: &auth.client_secret,
        audience: &auth.audience,
        grant_type: "client_credentials",
    };
    let response = client
        .post(auth.token_url())
        .json(&body)
        .send()
        .await?
        .error_for_status()?;
    let token: TokenResponse = response.json().await?;
    Ok(Credential {
        token_type: token.token_type,
        access_token: token.access_token,
        expires_in: token.expires_in.map(Duration::from_secs),
    })
}

pub async fn fetch_token(client: &Client, auth: &AuthConfig) -> Result<Credential, AuthError> {
    tracing::info!(url = %auth.token_url(), "requesting access token");
    fetch_with_retry(MAX_RETRIES, BACKOFF_BASE, || {
        let client = client.clone();
        let auth = auth.clone();
        async move { request_token(&client, &auth).await }
    })
    .await
}

async fn fetch_with_retry<F, Fut>(
    max_retries: u32,
    base: Duration,
    mut attempt_fn: F,
) -> Result<Credential, AuthError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<Credential>>,
{
    let mut last = String::new();
    for attempt in 1..=max_retries {
        match attempt_fn().await {
            Ok(credential) => return Ok(credential),
            Err(err) => {
                last = err.to_string();
                tracing::warn!(attempt, error = %err, "token fetch failed; backing off");
                sleep(backoff_delay(base, attempt)).await;
            }
        }
    }
    Err(AuthError::Unavailable {
        attempts: max_retries,
        last,
    })
}

/// Credential manager: fetches at startup, then sleeps until expiry and
/// re-fetches in a single loop. One fetch in flight at any time; a failed
/// renewal keeps the previous credential and retries after
/// `refresh_fallback`. The first resolution notifies the watch channel
/// whether it succeeded or not, so the publisher's gated connect always
/// proceeds.
pub async fn run_token_manager(
    client: Client,
    auth: AuthConfig,
    refresh_fallback: Duration,
    credentials: watch::Sender<Credential>,
    shutdown: ShutdownRx,
) {
    let fetch = move || {
        let client = client.clone();
        let auth = auth.clone();
        async move { fetch_token(&client, &auth).await }
    };
    run_token_loop(fetch, refresh_fallback, credentials, shutdown).await;
}

async fn run_token_loop<F, Fut>(
    mut fetch: F,
    refresh_fallback: Duration,
    credentials: watch::Sender<Credential>,
    mut stop: ShutdownRx,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Credential, AuthError>>,
{
    let mut resolved_once = false;
    loop {
        let fetched = tokio::select! {
            res = fetch() => res,
            _ = shutdown::wait(&mut stop) => return,
        };

        let sleep_for = match fetched {
            Ok(credential) => {
                let expires_in = credential.expires_in;
                tracing::info!(
                    token_type = %credential.token_type,
                    expires_in_secs = expires_in.map(|d| d.as_secs()),
                    "access token active"
                );
                let _ = credentials.send(credential);
                match expires_in {
                    Some(ttl) => ttl,
                    None => {
                        // Non-expiring token: nothing left to renew.
                        shutdown::wait(&mut stop).await;
                        return;
                    }
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "token refresh failed; keeping previous credential");
                if !resolved_once {
                    // Wake connect-side waiters; they proceed with the
                    // fallback credential already in the cell.
                    let current = credentials.borrow().clone();
                    let _ = credentials.send(current);
                }
                refresh_fallback
            }
        };
        resolved_once = true;

        tokio::select! {
            _ = sleep(sleep_for) => {}
            _ = shutdown::wait(&mut stop) => return,
        }
    }
}
