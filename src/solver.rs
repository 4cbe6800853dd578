//! Challenge solver adapter
//!
//! Talks to a 2captcha-style solving service: submit the login page's
//! challenge, poll until a token comes back, give up at the deadline.
//! Retry policy belongs to the caller; a failed solve here is final.
//! Tokens are single-use and short-lived; nothing is ever cached.

use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::config::SolverConfig;

#[derive(Debug, Error)]
pub enum SolverError {
    #[error("solver rejected the API key")]
    WrongApiKey,

    #[error("solver account has zero balance")]
    ZeroBalance,

    #[error("solver rejected the site key")]
    WrongSiteKey,

    #[error("solver rejected the request: {0}")]
    Rejected(String),

    #[error("no solution within {0:?}")]
    Timeout(Duration),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// Solver service response; `request` carries the job id, the token,
/// or an error code depending on `status`.
#[derive(Debug, Deserialize)]
struct SolverResponse {
    status: u8,
    request: String,
}

const NOT_READY: &str = "CAPCHA_NOT_READY";

/// Client for the external challenge-solving service
pub struct SolverClient {
    client: Client,
    config: SolverConfig,
}

impl SolverClient {
    pub fn new(config: SolverConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    /// Obtain one fresh challenge token.
    ///
    /// Submits the challenge, waits out the initial grace delay (the
    /// service is empirically slow to start processing), then polls on
    /// a fixed interval until the token arrives or the budget runs out.
    pub async fn solve(&self) -> Result<String, SolverError> {
        let deadline = Instant::now() + self.config.timeout();
        let job_id = self.submit().await?;
        debug!(%job_id, "challenge submitted");

        sleep(self.config.initial_delay()).await;

        while Instant::now() < deadline {
            if let Some(token) = self.poll(&job_id).await? {
                debug!(%job_id, "challenge solved");
                return Ok(token);
            }
            sleep(self.config.poll_interval()).await;
        }

        warn!(%job_id, "challenge solve timed out");
        Err(SolverError::Timeout(self.config.timeout()))
    }

    async fn submit(&self) -> Result<String, SolverError> {
        let url = format!("{}/in.php", self.config.api_base.trim_end_matches('/'));
        let response: SolverResponse = self
            .client
            .post(&url)
            .query(&[
                ("key", self.config.api_key.as_str()),
                ("method", "userrecaptcha"),
                ("googlekey", self.config.site_key.as_str()),
                ("pageurl", self.config.page_url.as_str()),
                ("json", "1"),
            ])
            .send()
            .await?
            .json()
            .await?;

        if response.status == 1 {
            Ok(response.request)
        } else {
            Err(classify_error(&response.request))
        }
    }

    /// One poll: `Ok(None)` means not ready yet, anything other than a
    /// token or "not ready" fails the solve immediately.
    async fn poll(&self, job_id: &str) -> Result<Option<String>, SolverError> {
        let url = format!("{}/res.php", self.config.api_base.trim_end_matches('/'));
        let response: SolverResponse = self
            .client
            .get(&url)
            .query(&[
                ("key", self.config.api_key.as_str()),
                ("action", "get"),
                ("id", job_id),
                ("json", "1"),
            ])
            .send()
            .await?
            .json()
            .await?;

        if response.status == 1 {
            Ok(Some(response.request))
        } else if response.request == NOT_READY {
            Ok(None)
        } else {
            Err(classify_error(&response.request))
        }
    }
}

fn classify_error(code: &str) -> SolverError {
    match code {
        "ERROR_WRONG_USER_KEY" | "ERROR_KEY_DOES_NOT_EXIST" => SolverError::WrongApiKey,
        "ERROR_ZERO_BALANCE" => SolverError::ZeroBalance,
        "ERROR_GOOGLEKEY" | "ERROR_WRONG_GOOGLEKEY" => SolverError::WrongSiteKey,
        other => SolverError::Rejected(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_error() {
        assert!(matches!(
            classify_error("ERROR_WRONG_USER_KEY"),
            SolverError::WrongApiKey
        ));
        assert!(matches!(
            classify_error("ERROR_ZERO_BALANCE"),
            SolverError::ZeroBalance
        ));
        assert!(matches!(
            classify_error("ERROR_GOOGLEKEY"),
            SolverError::WrongSiteKey
        ));
        assert!(matches!(
            classify_error("ERROR_CAPTCHA_UNSOLVABLE"),
            SolverError::Rejected(_)
        ));
    }

    #[test]
    fn test_response_parsing() {
        let ok: SolverResponse =
            serde_json::from_str(r#"{"status": 1, "request": "job-42"}"#).unwrap();
        assert_eq!(ok.status, 1);
        assert_eq!(ok.request, "job-42");

        let pending: SolverResponse =
            serde_json::from_str(r#"{"status": 0, "request": "CAPCHA_NOT_READY"}"#).unwrap();
        assert_eq!(pending.request, NOT_READY);
    }
}
