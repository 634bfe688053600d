//! Rendering decisions for a transport.
//!
//! Any request that was counted gets the three rate headers, whether it was
//! admitted or not. Denied requests additionally get a failure built by an
//! [`ErrorFactory`].

use serde::Serialize;
use serde_json::json;

use crate::ratelimit::{Evaluation, RateResult};

pub const LIMIT_HEADER: &str = "x-ratelimit-limit";
pub const REMAINING_HEADER: &str = "x-ratelimit-remaining";
pub const RESET_HEADER: &str = "x-ratelimit-reset";

/// Default denial message. `{window}` is replaced with the window length in seconds.
pub const DEFAULT_DENIAL_MESSAGE: &str = "Too many requests, please try again in {window} seconds.";

/// Header name/value pairs for a rate result. The reset is rendered as unix
/// epoch seconds.
pub fn rate_headers(result: &RateResult) -> [(&'static str, String); 3] {
    [
        (LIMIT_HEADER, result.limit.to_string()),
        (REMAINING_HEADER, result.remaining.to_string()),
        (RESET_HEADER, result.reset.timestamp().to_string()),
    ]
}

/// Headers to render for an evaluation; empty when nothing was counted.
pub fn evaluation_headers(evaluation: &Evaluation) -> Vec<(&'static str, String)> {
    evaluation
        .rate_result()
        .map(|result| rate_headers(result).to_vec())
        .unwrap_or_default()
}

/// Builds the failure a transport renders for a denied request.
pub trait ErrorFactory: Send + Sync {
    type Failure;

    fn build(&self, result: &RateResult) -> Self::Failure;
}

/// A transport-neutral denial, suitable for HTTP hosts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rejection {
    /// HTTP status to respond with
    pub status: u16,
    pub message: String,
    pub result: RateResult,
}

impl Rejection {
    /// Headers to send with the rejection, including `retry-after`.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = rate_headers(&self.result).to_vec();
        let retry_after = self.result.retry_after_secs(chrono::Utc::now());
        headers.push(("retry-after", retry_after.to_string()));
        headers
    }

    /// JSON response body.
    pub fn body(&self) -> serde_json::Value {
        json!({
            "error": "rate_limited",
            "message": self.message,
            "limit": self.result.limit,
            "remaining": self.result.remaining,
            "reset": self.result.reset.timestamp(),
        })
    }
}

/// Builds [`Rejection`]s from a message template.
#[derive(Debug, Clone)]
pub struct MessageErrorFactory {
    template: String,
    status: u16,
}

impl MessageErrorFactory {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            status: 429,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    /// Render the message for `result`.
    pub fn message(&self, result: &RateResult) -> String {
        self.template
            .replace("{window}", &result.window_secs.to_string())
            .replace("{limit}", &result.limit.to_string())
    }
}

impl Default for MessageErrorFactory {
    fn default() -> Self {
        Self::new(DEFAULT_DENIAL_MESSAGE)
    }
}

impl ErrorFactory for MessageErrorFactory {
    type Failure = Rejection;

    fn build(&self, result: &RateResult) -> Rejection {
        Rejection {
            status: self.status,
            message: self.message(result),
            result: *result,
        }
    }
}
