//! gRPC boundary for tonic services.
//!
//! Denials are rendered as `RESOURCE_EXHAUSTED` and the rate headers travel
//! as response metadata, on successful responses and on failures alike.

mod guard;

pub use guard::{Admission, RateLimitGuard};

use chrono::Utc;
use tonic::metadata::{MetadataMap, MetadataValue};
use tonic::Status;

use crate::boundary::{ErrorFactory, MessageErrorFactory, LIMIT_HEADER, REMAINING_HEADER, RESET_HEADER};
use crate::ratelimit::RateResult;

/// Copy the rate headers into `metadata`.
pub fn annotate(metadata: &mut MetadataMap, result: &RateResult) {
    metadata.insert(LIMIT_HEADER, MetadataValue::from(result.limit));
    metadata.insert(REMAINING_HEADER, MetadataValue::from(result.remaining));
    metadata.insert(RESET_HEADER, MetadataValue::from(result.reset.timestamp()));
}

/// Builds `RESOURCE_EXHAUSTED` statuses for denied requests.
#[derive(Debug, Clone, Default)]
pub struct StatusErrorFactory {
    messages: MessageErrorFactory,
}

impl StatusErrorFactory {
    pub fn new(messages: MessageErrorFactory) -> Self {
        Self { messages }
    }
}

impl ErrorFactory for StatusErrorFactory {
    type Failure = Status;

    fn build(&self, result: &RateResult) -> Status {
        let mut status = Status::resource_exhausted(self.messages.message(result));
        let metadata = status.metadata_mut();
        annotate(metadata, result);
        metadata.insert(
            "retry-after",
            MetadataValue::from(result.retry_after_secs(Utc::now())),
        );
        status
    }
}
