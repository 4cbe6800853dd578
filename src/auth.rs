//! Session authentication against the cloud backend
//!
//! A [`Session`] is an immutable bundle of tokens replaced wholesale on
//! every successful login or refresh. It is never partially mutated,
//! so callers either hold a fully populated session or none at all.
//!
//! The password travels only as a lowercase-hex MD5 digest. That exact
//! digest and encoding are what the backend compares against; anything
//! else fails authentication silently.

use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::Config;
use crate::protocol::{LoginRequest, LoginResponse, LoginUser, RefreshResponse};
use crate::solver::{SolverClient, SolverError};

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("backend rejected login: {message}")]
    Rejected { message: String },

    #[error("challenge solve failed: {0}")]
    Solver(#[from] SolverError),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("malformed login response")]
    Malformed,
}

#[derive(Debug, Error)]
pub enum RefreshError {
    /// The refresh token itself has expired; fall back to a full login.
    #[error("refresh token expired or rejected")]
    Expired,

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("malformed refresh response")]
    Malformed,
}

/// Proof of an authenticated backend connection
#[derive(Debug, Clone)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: String,
    pub session_id: String,
    pub user_id: String,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    /// True when the access token expires within `margin` from now.
    pub fn expires_within(&self, margin: Duration) -> bool {
        let margin = chrono::Duration::from_std(margin).unwrap_or_else(|_| chrono::Duration::zero());
        Utc::now() + margin >= self.expires_at
    }
}

/// Digest format required by the login endpoint: MD5, lowercase hex.
pub(crate) fn hash_password(password: &str) -> String {
    format!("{:x}", md5::compute(password.as_bytes()))
}

/// Exchanges credentials for sessions
pub struct Authenticator {
    client: Client,
    config: Config,
}

impl Authenticator {
    pub fn new(client: Client, config: Config) -> Self {
        Self { client, config }
    }

    /// Log in with the configured credentials, optionally carrying a
    /// solved challenge token. Whether the backend insists on the
    /// token varies by account; both paths go through here.
    pub async fn login(&self, challenge_token: Option<&str>) -> Result<Session, AuthError> {
        let identity = &self.config.identity;
        let body = LoginRequest {
            user: LoginUser {
                user_id: self.config.username.clone(),
                password: hash_password(&self.config.password),
                mobile_device_id: identity.mobile_device_id.clone(),
                device_token_id: identity.device_token_id.clone(),
                app_type: identity.app_type.clone(),
                app_version: identity.app_version.clone(),
                time_zone: identity.time_zone.clone(),
                mobile_device_name: identity.mobile_device_name.clone(),
                device_type: identity.device_type.clone(),
                ip_address: self.config.ip_address.clone(),
                is_smart_hvac: identity.is_smart_hvac.clone(),
                locale: identity.locale.clone(),
            },
            captcha_token: challenge_token.map(str::to_string),
        };

        let url = format!("{}/auth/login", self.config.api_base.trim_end_matches('/'));
        debug!(challenge = challenge_token.is_some(), "sending login request");
        let response: LoginResponse = self.client.post(&url).json(&body).send().await?.json().await?;

        if response.status != 200 {
            return Err(AuthError::Rejected {
                message: response.message,
            });
        }

        let user = response
            .data
            .and_then(|d| d.user)
            .ok_or(AuthError::Malformed)?;

        info!(user_id = %user.user_id, "login accepted");
        Ok(Session {
            access_token: user.access_token,
            refresh_token: user.refresh_token,
            session_id: user.session_id,
            user_id: user.user_id,
            expires_at: Utc::now() + chrono::Duration::seconds(user.expires_in),
        })
    }

    /// Exchange the refresh token for a new session without a login
    /// round-trip. User and session ids carry over unchanged.
    pub async fn refresh(&self, session: &Session) -> Result<Session, RefreshError> {
        let url = format!(
            "{}/web/token/refresh",
            self.config.api_base.trim_end_matches('/')
        );
        let response = self
            .client
            .get(&url)
            .query(&[("refreshToken", session.refresh_token.as_str())])
            .bearer_auth(&session.refresh_token)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(RefreshError::Expired);
        }

        let parsed: RefreshResponse = response.json().await?;
        let data = parsed.data.ok_or(RefreshError::Expired)?;

        debug!(user_id = %session.user_id, "access token refreshed");
        Ok(Session {
            access_token: data.access_token,
            refresh_token: data.refresh_token,
            session_id: session.session_id.clone(),
            user_id: session.user_id.clone(),
            expires_at: Utc::now() + chrono::Duration::seconds(data.expires_in),
        })
    }

    /// Common entry path: solve the challenge, then log in with the
    /// resulting token.
    pub async fn login_with_solved_challenge(
        &self,
        solver: &SolverClient,
    ) -> Result<Session, AuthError> {
        let token = solver.solve().await?;
        self.login(Some(&token)).await
    }
}
