use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::redirect::Policy;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::RunConfig;

/// Bodies beyond this are cut before classification.
pub const MAX_BODY_BYTES: usize = 256 * 1024;

const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub form: Vec<(String, String)>,
    pub user_agent: Option<String>,
    pub follow_redirects: bool,
    pub timeout: Duration,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>, timeout: Duration) -> Self {
        HttpRequest {
            method: HttpMethod::Get,
            url: url.into(),
            form: Vec::new(),
            user_agent: None,
            follow_redirects: true,
            timeout,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawResponse {
    pub status: u16,
    /// Lower-cased header names.
    pub headers: BTreeMap<String, String>,
    pub body: String,
    pub elapsed: Duration,
}

impl RawResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn is_html(&self) -> bool {
        if let Some(content_type) = self.header("content-type") {
            return content_type.to_ascii_lowercase().contains("text/html");
        }
        let head = self.body.trim_start().to_ascii_lowercase();
        head.starts_with("<!doctype html") || head.starts_with("<html") || head.contains("<form")
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("request failed: {0}")]
    Other(String),
}

impl TransportError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout(_))
    }
}

/// The only way the engine talks to the network.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<RawResponse, TransportError>;
}

/// reqwest-backed transport; one connection pool shared by every worker.
pub struct ReqwestTransport {
    client: Client,
    no_redirect_client: Client,
}

impl ReqwestTransport {
    pub fn new(proxy: Option<&str>) -> Result<Self, TransportError> {
        Ok(ReqwestTransport {
            client: build_client(proxy, Policy::limited(10))?,
            no_redirect_client: build_client(proxy, Policy::none())?,
        })
    }

    pub fn from_config(config: &RunConfig) -> Result<Self, TransportError> {
        Self::new(config.proxy.as_deref())
    }
}

fn build_client(proxy: Option<&str>, redirects: Policy) -> Result<Client, TransportError> {
    let mut builder = Client::builder()
        .user_agent(DEFAULT_USER_AGENT)
        .redirect(redirects);

    if let Some(proxy) = proxy {
        let proxy = reqwest::Proxy::all(proxy)
            .map_err(|e| TransportError::InvalidRequest(format!("proxy {}: {}", proxy, e)))?;
        builder = builder.proxy(proxy);
    }

    builder
        .build()
        .map_err(|e| TransportError::InvalidRequest(e.to_string()))
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<RawResponse, TransportError> {
        let client = if request.follow_redirects {
            &self.client
        } else {
            &self.no_redirect_client
        };

        let mut builder = match request.method {
            HttpMethod::Get => client.get(&request.url).query(&request.form),
            HttpMethod::Post => client.post(&request.url).form(&request.form),
        };
        builder = builder.timeout(request.timeout);
        if let Some(user_agent) = &request.user_agent {
            builder = builder.header(reqwest::header::USER_AGENT, user_agent);
        }

        let started = Instant::now();
        let response = builder
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, request.timeout))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();

        let mut body = response
            .text()
            .await
            .map_err(|e| map_reqwest_error(e, request.timeout))?;
        truncate_at_char_boundary(&mut body, MAX_BODY_BYTES);

        Ok(RawResponse {
            status,
            headers,
            body,
            elapsed: started.elapsed(),
        })
    }
}

fn map_reqwest_error(error: reqwest::Error, timeout: Duration) -> TransportError {
    if error.is_timeout() {
        TransportError::Timeout(timeout)
    } else if error.is_connect() {
        TransportError::Connect(error.to_string())
    } else if error.is_builder() {
        TransportError::InvalidRequest(error.to_string())
    } else {
        TransportError::Other(error.to_string())
    }
}

pub fn truncate_at_char_boundary(s: &mut String, max_bytes: usize) {
    if s.len() <= max_bytes {
        return;
    }
    let mut cut = max_bytes;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    s.truncate(cut);
}
