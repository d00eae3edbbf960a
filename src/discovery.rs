use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use lazy_static::lazy_static;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::transport::{HttpMethod, HttpRequest, RawResponse, Transport, TransportError};

pub const RESET_PATHS: [&str; 13] = [
    "/forgot-password",
    "/password/reset",
    "/auth/forgot",
    "/account/password/reset",
    "/reset-password",
    "/user/password-reset",
    "/password_reset",
    "/resetpassword",
    "/forgot_password",
    "/recover-password",
    "/password/recover",
    "/api/auth/forgot-password",
    "/api/password/reset",
];

pub const OAUTH_PATHS: [&str; 7] = [
    "/oauth/authorize",
    "/oauth2/authorize",
    "/auth/oauth",
    "/api/oauth",
    "/login/oauth",
    "/oauth/callback",
    "/auth/callback",
];

pub const PROVIDERS: [&str; 7] = [
    "google", "facebook", "github", "linkedin", "twitter", "microsoft", "apple",
];

pub const SECURITY_HEADERS: [&str; 5] = [
    "x-frame-options",
    "x-content-type-options",
    "strict-transport-security",
    "content-security-policy",
    "x-xss-protection",
];

const RECOVERY_FIELD_MARKERS: [&str; 3] = ["email", "reset", "token"];
const OAUTH_HINT_FIELD: &str = "login_hint";

lazy_static! {
    static ref FORM_SELECTOR: Selector = Selector::parse("form").expect("valid selector");
    static ref FIELD_SELECTOR: Selector =
        Selector::parse("input[name], textarea[name], select[name]").expect("valid selector");
    static ref ANCHOR_SELECTOR: Selector = Selector::parse("a[href]").expect("valid selector");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EndpointKind {
    PasswordReset,
    OAuth,
    GenericForm,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub server: Option<String>,
    pub security_headers: BTreeMap<String, bool>,
}

impl Fingerprint {
    fn from_response(response: &RawResponse) -> Self {
        Fingerprint {
            server: response.header("server").map(str::to_string),
            security_headers: security_headers(response),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub url: String,
    pub method: HttpMethod,
    pub kind: EndpointKind,
    /// field name -> input type
    pub fields: BTreeMap<String, String>,
    /// hidden inputs re-sent verbatim (CSRF tokens and the like)
    pub defaults: BTreeMap<String, String>,
    pub provider: Option<String>,
    /// probe path or page the endpoint was found on
    pub source: String,
    pub fingerprint: Fingerprint,
}

impl Endpoint {
    /// A user-declared recovery endpoint that is attacked without probing.
    pub fn declared(target: &Url, path: &str) -> Self {
        Endpoint {
            url: join_path(target, path),
            method: HttpMethod::Post,
            kind: EndpointKind::PasswordReset,
            fields: BTreeMap::from([("email".to_string(), "email".to_string())]),
            defaults: BTreeMap::new(),
            provider: None,
            source: "declared".to_string(),
            fingerprint: Fingerprint::default(),
        }
    }

    /// Name of the field the candidate address is bound to.
    pub fn email_field(&self) -> Option<&str> {
        let bindable = |ty: &str| matches!(ty, "email" | "text" | "search" | "textarea" | "");

        self.fields
            .iter()
            .find(|(_, ty)| ty.as_str() == "email")
            .or_else(|| {
                self.fields
                    .iter()
                    .find(|(name, ty)| bindable(ty) && name.to_ascii_lowercase().contains("mail"))
            })
            .or_else(|| {
                self.fields.iter().find(|(name, ty)| {
                    let name = name.to_ascii_lowercase();
                    bindable(ty)
                        && (name.contains("user") || name.contains("login") || name.contains("hint"))
                })
            })
            .or_else(|| self.fields.iter().find(|(_, ty)| bindable(ty)))
            .map(|(name, _)| name.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteFingerprint {
    pub server: Option<String>,
    pub powered_by: Option<String>,
    pub cms: Option<String>,
    pub security_headers: BTreeMap<String, bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryReport {
    pub target: String,
    pub endpoints: Vec<Endpoint>,
    /// provider -> links found on the landing page
    pub providers: BTreeMap<String, Vec<String>>,
    pub site: SiteFingerprint,
}

#[derive(Debug, Error)]
pub enum DiscoveryProbeError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("unexpected status {0}")]
    Unreachable(u16),

    #[error("response is not HTML")]
    NotHtml,

    #[error("redirect from a non-OAuth path")]
    Redirected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProbeKind {
    Reset,
    OAuth,
}

struct ParsedForm {
    action: String,
    method: HttpMethod,
    fields: BTreeMap<String, String>,
    defaults: BTreeMap<String, String>,
}

struct LandingPage {
    site: SiteFingerprint,
    providers: BTreeMap<String, Vec<String>>,
    endpoints: Vec<Endpoint>,
}

pub struct EndpointDiscovery {
    transport: Arc<dyn Transport>,
    probe_timeout: Duration,
}

impl EndpointDiscovery {
    pub fn new(transport: Arc<dyn Transport>, probe_timeout: Duration) -> Self {
        EndpointDiscovery {
            transport,
            probe_timeout,
        }
    }

    /// Best-effort: failed probes are dropped, never returned as errors.
    #[tracing::instrument(skip(self, target), fields(target = %target))]
    pub async fn discover(&self, target: &Url) -> DiscoveryReport {
        info!("probing {} well-known paths", RESET_PATHS.len() + OAUTH_PATHS.len());

        let probes = RESET_PATHS
            .iter()
            .map(|p| (*p, ProbeKind::Reset))
            .chain(OAUTH_PATHS.iter().map(|p| (*p, ProbeKind::OAuth)));
        let results = join_all(probes.map(|(path, kind)| async move {
            (path, self.probe(target, path, kind).await)
        }))
        .await;

        let mut endpoints = Vec::new();
        for (path, result) in results {
            match result {
                Ok(found) => endpoints.extend(found),
                Err(e) => debug!(path, error = %e, "probe skipped"),
            }
        }

        let landing = self.inspect_landing_page(target).await;
        endpoints.extend(landing.endpoints);

        let mut seen = HashSet::new();
        endpoints.retain(|e| seen.insert((e.method, e.url.clone())));

        info!(
            endpoints = endpoints.len(),
            providers = landing.providers.len(),
            "discovery complete"
        );

        DiscoveryReport {
            target: target.to_string(),
            endpoints,
            providers: landing.providers,
            site: landing.site,
        }
    }

    async fn probe(
        &self,
        target: &Url,
        path: &str,
        kind: ProbeKind,
    ) -> Result<Vec<Endpoint>, DiscoveryProbeError> {
        let url = join_path(target, path);
        let mut request = HttpRequest::get(url.clone(), self.probe_timeout);
        request.follow_redirects = false;

        let response = self.transport.send(request).await?;
        let fingerprint = Fingerprint::from_response(&response);

        match response.status {
            200 if response.is_html() => {}
            200 => return Err(DiscoveryProbeError::NotHtml),
            301 | 302 if kind == ProbeKind::OAuth => {
                let location = response.header("location").unwrap_or_default();
                let provider = detect_provider(location).or_else(|| detect_provider(path));
                return Ok(vec![oauth_endpoint(url, path, provider, fingerprint)]);
            }
            301 | 302 => return Err(DiscoveryProbeError::Redirected),
            status => return Err(DiscoveryProbeError::Unreachable(status)),
        }

        let forms = parse_forms(&response.body, &url);
        let body = response.body.to_ascii_lowercase();
        let mut endpoints: Vec<Endpoint> = forms
            .into_iter()
            .filter_map(|form| form_endpoint(form, path, &body, &fingerprint))
            .collect();

        if endpoints.is_empty() {
            endpoints.push(match kind {
                ProbeKind::Reset => Endpoint {
                    url,
                    method: HttpMethod::Post,
                    kind: EndpointKind::PasswordReset,
                    fields: BTreeMap::from([("email".to_string(), "email".to_string())]),
                    defaults: BTreeMap::new(),
                    provider: None,
                    source: path.to_string(),
                    fingerprint,
                },
                ProbeKind::OAuth => oauth_endpoint(url, path, detect_provider(&body), fingerprint),
            });
        }

        Ok(endpoints)
    }

    async fn inspect_landing_page(&self, target: &Url) -> LandingPage {
        let mut landing = LandingPage {
            site: SiteFingerprint::default(),
            providers: BTreeMap::new(),
            endpoints: Vec::new(),
        };

        let request = HttpRequest::get(target.as_str(), self.probe_timeout);
        let response = match self.transport.send(request).await {
            Ok(response) => response,
            Err(e) => {
                debug!(error = %e, "landing page unreachable");
                return landing;
            }
        };

        landing.site = site_fingerprint(&response);
        if !response.is_html() {
            return landing;
        }

        let page_url = target.as_str().to_string();
        landing.providers = provider_links(&response.body);

        let body = response.body.to_ascii_lowercase();
        let fingerprint = Fingerprint::from_response(&response);
        landing.endpoints = parse_forms(&response.body, &page_url)
            .into_iter()
            .filter_map(|form| form_endpoint(form, "/", &body, &fingerprint))
            .collect();

        landing
    }
}

/// Resolves `path` as a URL reference, so absolute paths land on the host root.
pub fn join_path(target: &Url, path: &str) -> String {
    match target.join(path) {
        Ok(url) => url.to_string(),
        Err(_) => format!(
            "{}/{}",
            target.as_str().trim_end_matches('/'),
            path.trim_start_matches('/')
        ),
    }
}

fn oauth_endpoint(
    url: String,
    path: &str,
    provider: Option<String>,
    fingerprint: Fingerprint,
) -> Endpoint {
    Endpoint {
        url,
        method: HttpMethod::Get,
        kind: EndpointKind::OAuth,
        fields: BTreeMap::from([(OAUTH_HINT_FIELD.to_string(), "text".to_string())]),
        defaults: BTreeMap::new(),
        provider,
        source: path.to_string(),
        fingerprint,
    }
}

fn form_endpoint(
    form: ParsedForm,
    path: &str,
    body_lower: &str,
    fingerprint: &Fingerprint,
) -> Option<Endpoint> {
    let recovery = form.fields.keys().any(|name| {
        let name = name.to_ascii_lowercase();
        RECOVERY_FIELD_MARKERS.iter().any(|m| name.contains(m))
    });

    let (kind, provider) = if recovery {
        (EndpointKind::PasswordReset, None)
    } else if let Some(provider) = detect_provider(path).or_else(|| detect_provider(body_lower)) {
        (EndpointKind::OAuth, Some(provider))
    } else if path.contains("oauth") || body_lower.contains("oauth") {
        (EndpointKind::OAuth, None)
    } else {
        (EndpointKind::GenericForm, None)
    };

    let endpoint = Endpoint {
        url: form.action,
        method: form.method,
        kind,
        fields: form.fields,
        defaults: form.defaults,
        provider,
        source: path.to_string(),
        fingerprint: fingerprint.clone(),
    };

    // Nothing to bind the candidate address to
    endpoint.email_field()?;
    Some(endpoint)
}

fn parse_forms(body: &str, page_url: &str) -> Vec<ParsedForm> {
    let document = Html::parse_document(body);
    let base = Url::parse(page_url).ok();

    document
        .select(&FORM_SELECTOR)
        .map(|form| {
            let action_attr = form.value().attr("action").unwrap_or("").trim();
            let action = match &base {
                Some(base) if !action_attr.is_empty() => base
                    .join(action_attr)
                    .map(|u| u.to_string())
                    .unwrap_or_else(|_| page_url.to_string()),
                _ => page_url.to_string(),
            };
            let method = match form.value().attr("method") {
                Some(m) if m.eq_ignore_ascii_case("post") => HttpMethod::Post,
                _ => HttpMethod::Get,
            };

            let mut fields = BTreeMap::new();
            let mut defaults = BTreeMap::new();
            for field in form.select(&FIELD_SELECTOR) {
                let Some(name) = field.value().attr("name") else {
                    continue;
                };
                let ty = field_type(&field);
                if ty == "hidden" {
                    if let Some(value) = field.value().attr("value") {
                        defaults.insert(name.to_string(), value.to_string());
                    }
                }
                fields.insert(name.to_string(), ty);
            }

            ParsedForm {
                action,
                method,
                fields,
                defaults,
            }
        })
        .collect()
}

fn field_type(field: &ElementRef<'_>) -> String {
    match field.value().name() {
        "input" => field
            .value()
            .attr("type")
            .unwrap_or("text")
            .to_ascii_lowercase(),
        other => other.to_string(),
    }
}

fn provider_links(body: &str) -> BTreeMap<String, Vec<String>> {
    let document = Html::parse_document(body);
    let mut providers: BTreeMap<String, Vec<String>> = BTreeMap::new();

    for anchor in document.select(&ANCHOR_SELECTOR) {
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        if let Some(provider) = detect_provider(href) {
            providers.entry(provider).or_default().push(href.to_string());
        }
    }

    providers
}

fn detect_provider(text: &str) -> Option<String> {
    let text = text.to_ascii_lowercase();
    PROVIDERS
        .iter()
        .find(|p| text.contains(*p))
        .map(|p| p.to_string())
}

fn security_headers(response: &RawResponse) -> BTreeMap<String, bool> {
    SECURITY_HEADERS
        .iter()
        .map(|h| (h.to_string(), response.header(h).is_some()))
        .collect()
}

fn site_fingerprint(response: &RawResponse) -> SiteFingerprint {
    let cms = if response.body.contains("wp-content") {
        Some("WordPress")
    } else if response.body.contains("Joomla") {
        Some("Joomla")
    } else if response.body.contains("Drupal") {
        Some("Drupal")
    } else {
        None
    };

    SiteFingerprint {
        server: response.header("server").map(str::to_string),
        powered_by: response.header("x-powered-by").map(str::to_string),
        cms: cms.map(str::to_string),
        security_headers: security_headers(response),
    }
}
