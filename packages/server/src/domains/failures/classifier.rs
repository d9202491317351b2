//! Maps agent error messages to a failure category and a remediation hint.
//!
//! Rules are ordered; the first whose keyword appears (case-insensitively) in
//! the message wins.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FailureCategory {
    #[serde(rename = "Timeout")]
    Timeout,
    #[serde(rename = "Selector Not Found")]
    SelectorNotFound,
    #[serde(rename = "Network Error")]
    NetworkError,
    #[serde(rename = "Rate Limited")]
    RateLimited,
    #[serde(rename = "Authorization Error")]
    AuthorizationError,
    #[serde(rename = "Page Load Failure")]
    PageLoadFailure,
    #[serde(rename = "JavaScript Error")]
    JavaScriptError,
    #[serde(rename = "CAPTCHA/Bot Detection")]
    BotDetection,
    #[serde(rename = "Data Format Error")]
    DataFormatError,
    #[serde(rename = "Unknown Error")]
    Unknown,
}

impl FailureCategory {
    pub fn label(&self) -> &'static str {
        match self {
            FailureCategory::Timeout => "Timeout",
            FailureCategory::SelectorNotFound => "Selector Not Found",
            FailureCategory::NetworkError => "Network Error",
            FailureCategory::RateLimited => "Rate Limited",
            FailureCategory::AuthorizationError => "Authorization Error",
            FailureCategory::PageLoadFailure => "Page Load Failure",
            FailureCategory::JavaScriptError => "JavaScript Error",
            FailureCategory::BotDetection => "CAPTCHA/Bot Detection",
            FailureCategory::DataFormatError => "Data Format Error",
            FailureCategory::Unknown => "Unknown Error",
        }
    }

    pub fn suggested_fix(&self) -> &'static str {
        match self {
            FailureCategory::Timeout => {
                "Increase the agent timeout or simplify the goal so the page can be processed faster."
            }
            FailureCategory::SelectorNotFound => {
                "The page structure may have changed; make the goal describe the content instead of its location."
            }
            FailureCategory::NetworkError => {
                "Check that the target site is reachable from the agent and retry the affected rows."
            }
            FailureCategory::RateLimited => {
                "Lower the execution concurrency or spread runs against the same site over time."
            }
            FailureCategory::AuthorizationError => {
                "The page requires a login or blocks this client; supply credentials or choose a public URL."
            }
            FailureCategory::PageLoadFailure => {
                "Verify the URL is correct and the page loads in a regular browser."
            }
            FailureCategory::JavaScriptError => {
                "The page's scripts failed; retry later or target a simpler version of the page."
            }
            FailureCategory::BotDetection => {
                "The site blocks automated browsing; reduce request volume or use an alternate source."
            }
            FailureCategory::DataFormatError => {
                "The agent output could not be parsed; tighten the goal to ask for plain field values."
            }
            FailureCategory::Unknown => {
                "Inspect the raw log for this job and rerun it once the cause is understood."
            }
        }
    }

    /// Whether a retry has a reasonable chance of succeeding.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FailureCategory::Timeout | FailureCategory::NetworkError | FailureCategory::RateLimited
        )
    }

    pub fn from_label(label: &str) -> Option<Self> {
        RULES
            .iter()
            .map(|(category, _)| *category)
            .chain(std::iter::once(FailureCategory::Unknown))
            .find(|c| c.label() == label)
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Ordered classification rules. Keywords are lowercase.
const RULES: &[(FailureCategory, &[&str])] = &[
    (
        FailureCategory::Timeout,
        &["timeout", "timed out", "time out", "deadline exceeded"],
    ),
    (
        FailureCategory::SelectorNotFound,
        &[
            "selector",
            "element not found",
            "no such element",
            "could not find element",
            "unable to locate",
        ],
    ),
    (
        FailureCategory::NetworkError,
        &[
            "network",
            "connection refused",
            "connection reset",
            "econnrefused",
            "econnreset",
            "enotfound",
            "dns",
            "unreachable",
            "socket hang up",
            "net::err",
        ],
    ),
    (
        FailureCategory::RateLimited,
        &["rate limit", "429", "too many requests", "throttl"],
    ),
    (
        FailureCategory::AuthorizationError,
        &[
            "401",
            "403",
            "unauthorized",
            "forbidden",
            "authentication",
            "invalid session",
            "login required",
            "access denied",
        ],
    ),
    (
        FailureCategory::PageLoadFailure,
        &[
            "page load",
            "failed to load",
            "navigation",
            "404",
            "page not found",
            "502",
            "503",
        ],
    ),
    (
        FailureCategory::JavaScriptError,
        &["javascript", "script error", "referenceerror", "typeerror", "uncaught"],
    ),
    (
        FailureCategory::BotDetection,
        &["captcha", "bot detect", "cloudflare", "blocked", "are you a robot"],
    ),
    (
        FailureCategory::DataFormatError,
        &[
            "parse",
            "json",
            "invalid format",
            "unexpected token",
            "schema",
            "deserializ",
            "malformed",
        ],
    ),
];

/// A classified failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Classification {
    pub category: FailureCategory,
    pub suggested_fix: &'static str,
    pub transient: bool,
}

pub fn classify(message: &str) -> Classification {
    let lowered = message.to_lowercase();
    let category = RULES
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|k| lowered.contains(k)))
        .map(|(category, _)| *category)
        .unwrap_or(FailureCategory::Unknown);

    Classification {
        category,
        suggested_fix: category.suggested_fix(),
        transient: category.is_transient(),
    }
}
