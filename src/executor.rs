use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use tracing::debug;

use crate::config::RunConfig;
use crate::discovery::Endpoint;
use crate::transport::{HttpRequest, RawResponse, Transport, TransportError};
use crate::variant::Variant;

pub const USER_AGENTS: [&str; 5] = [
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:121.0) Gecko/20100101 Firefox/121.0",
];

// Used when a form exposes nothing the address can be bound to
const FALLBACK_FIELDS: [&str; 3] = ["email", "username", "user_email"];

/// Sends exactly one request per call; retries are the caller's business.
pub struct AttemptExecutor {
    transport: Arc<dyn Transport>,
    timeout: Duration,
    rotate_user_agent: bool,
}

impl AttemptExecutor {
    pub fn new(transport: Arc<dyn Transport>, config: &RunConfig) -> Self {
        AttemptExecutor {
            transport,
            timeout: config.timeout(),
            rotate_user_agent: config.rotates_user_agent(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn build_request(&self, email: &str, endpoint: &Endpoint) -> HttpRequest {
        let mut form: Vec<(String, String)> = endpoint
            .defaults
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();

        match endpoint.email_field() {
            Some(field) => {
                form.retain(|(name, _)| name != field);
                form.push((field.to_string(), email.to_string()));
            }
            None => form.extend(
                FALLBACK_FIELDS
                    .iter()
                    .map(|name| (name.to_string(), email.to_string())),
            ),
        }

        let user_agent = if self.rotate_user_agent {
            USER_AGENTS
                .choose(&mut rand::thread_rng())
                .map(|ua| ua.to_string())
        } else {
            None
        };

        HttpRequest {
            method: endpoint.method,
            url: endpoint.url.clone(),
            form,
            user_agent,
            follow_redirects: false,
            timeout: self.timeout,
        }
    }

    pub async fn execute(
        &self,
        variant: &Variant,
        endpoint: &Endpoint,
    ) -> Result<RawResponse, TransportError> {
        self.send(&variant.transformed, endpoint).await
    }

    /// Same request with the unmodified address, for later comparison.
    pub async fn execute_baseline(
        &self,
        email: &str,
        endpoint: &Endpoint,
    ) -> Result<RawResponse, TransportError> {
        self.send(email, endpoint).await
    }

    #[tracing::instrument(level = "debug", skip_all, fields(endpoint = %endpoint.url))]
    async fn send(&self, email: &str, endpoint: &Endpoint) -> Result<RawResponse, TransportError> {
        let request = self.build_request(email, endpoint);
        let result = self.transport.send(request).await;
        match &result {
            Ok(response) => debug!(
                endpoint = %endpoint.url,
                status = response.status,
                elapsed_ms = response.elapsed.as_millis() as u64,
                "attempt answered"
            ),
            Err(e) => debug!(endpoint = %endpoint.url, error = %e, "attempt failed"),
        }
        result
    }
}
