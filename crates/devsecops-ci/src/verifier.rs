//! Synthetic request checks against a running artifact.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{info, warn};

/// HTTP method of a runtime check.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Delete,
    Head,
}

impl HttpMethod {
    fn as_reqwest(&self) -> reqwest::Method {
        match self {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Delete => reqwest::Method::DELETE,
            HttpMethod::Head => reqwest::Method::HEAD,
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_reqwest())
    }
}

/// Predicate applied to a response body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BodyExpectation {
    /// Any body.
    #[default]
    Any,

    /// Exact match, ignoring surrounding whitespace.
    Equals { value: String },

    /// Substring match.
    Contains { value: String },

    /// The body is JSON and the value at `pointer` is the string `equals`.
    JsonField { pointer: String, equals: String },
}

impl BodyExpectation {
    pub fn matches(&self, body: &str) -> bool {
        match self {
            BodyExpectation::Any => true,
            BodyExpectation::Equals { value } => body.trim() == value,
            BodyExpectation::Contains { value } => body.contains(value.as_str()),
            BodyExpectation::JsonField { pointer, equals } => {
                serde_json::from_str::<serde_json::Value>(body)
                    .ok()
                    .and_then(|doc| doc.pointer(pointer).cloned())
                    .is_some_and(|v| v.as_str() == Some(equals.as_str()))
            }
        }
    }
}

/// A single synthetic request and its expected response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuntimeCheck {
    #[serde(default)]
    pub method: HttpMethod,

    /// Path appended to the base URL, starting with `/`.
    pub path: String,

    #[serde(default)]
    pub body: Option<String>,

    #[serde(default = "default_status")]
    pub expected_status: u16,

    #[serde(default)]
    pub expect: BodyExpectation,
}

fn default_status() -> u16 {
    200
}

impl RuntimeCheck {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            path: path.into(),
            body: None,
            expected_status: default_status(),
            expect: BodyExpectation::Any,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.expected_status = status;
        self
    }

    pub fn expect_body(mut self, expect: BodyExpectation) -> Self {
        self.expect = expect;
        self
    }

    pub fn expect_text(self, value: impl Into<String>) -> Self {
        self.expect_body(BodyExpectation::Equals {
            value: value.into(),
        })
    }

    /// `GET /health -> 200 {"status": "ok"}`
    pub fn health() -> Self {
        Self::get("/health").expect_body(BodyExpectation::JsonField {
            pointer: "/status".to_string(),
            equals: "ok".to_string(),
        })
    }

    /// `GET /echo/{msg} -> 200 {"message": msg}`
    pub fn echo(msg: &str) -> Self {
        Self::get(format!("/echo/{}", msg)).expect_body(BodyExpectation::JsonField {
            pointer: "/message".to_string(),
            equals: msg.to_string(),
        })
    }

    fn url(&self, base_url: &str) -> String {
        let base = base_url.trim_end_matches('/');
        if self.path.starts_with('/') {
            format!("{}{}", base, self.path)
        } else {
            format!("{}/{}", base, self.path)
        }
    }
}

impl fmt::Display for RuntimeCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.path)
    }
}

/// Verdict of a runtime check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    Pass,
    /// `actual_status` is `None` when no response was received; the
    /// transport error is then carried in `actual_body`.
    Fail {
        actual_status: Option<u16>,
        actual_body: String,
    },
}

impl Verification {
    pub fn is_pass(&self) -> bool {
        matches!(self, Verification::Pass)
    }
}

/// Issues runtime checks. One request per check, no retries.
pub struct RuntimeVerifier {
    client: reqwest::Client,
}

impl RuntimeVerifier {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    pub async fn verify(&self, check: &RuntimeCheck, base_url: &str) -> Verification {
        let url = check.url(base_url);
        let mut request = self.client.request(check.method.as_reqwest(), &url);
        if let Some(body) = &check.body {
            request = request.body(body.clone());
        }

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(check = %check, url = %url, error = %e, "Runtime check got no response");
                return Verification::Fail {
                    actual_status: None,
                    actual_body: e.to_string(),
                };
            }
        };

        let status = response.status().as_u16();
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                return Verification::Fail {
                    actual_status: Some(status),
                    actual_body: format!("unreadable body: {}", e),
                }
            }
        };

        if status == check.expected_status && check.expect.matches(&body) {
            info!(check = %check, status, "Runtime check passed");
            Verification::Pass
        } else {
            warn!(
                check = %check,
                status,
                expected_status = check.expected_status,
                "Runtime check failed"
            );
            Verification::Fail {
                actual_status: Some(status),
                actual_body: body,
            }
        }
    }
}
