//! Request guard wrapping tonic handlers.

use std::future::Future;
use std::sync::Arc;

use tonic::metadata::{KeyAndValueRef, MetadataMap};
use tonic::{Request, Response, Status};
use tracing::{debug, error, instrument};

use super::{annotate, StatusErrorFactory};
use crate::boundary::ErrorFactory;
use crate::ratelimit::{Evaluation, Method, RateLimiter, RateResult, RequestContext};

/// Attribute under which the peer address is exposed to identity extractors.
pub const REMOTE_ADDR_ATTRIBUTE: &str = "remote-addr";

/// A request that passed the limiter.
#[derive(Debug, Clone, Default)]
pub struct Admission {
    result: Option<RateResult>,
}

impl Admission {
    /// The rate result, when the request was counted.
    pub fn rate_result(&self) -> Option<&RateResult> {
        self.result.as_ref()
    }

    /// Add the rate headers to `metadata`, if the request was counted.
    pub fn annotate(&self, metadata: &mut MetadataMap) {
        if let Some(result) = &self.result {
            annotate(metadata, result);
        }
    }

    /// Add the rate headers to a handler response.
    pub fn finish<R>(&self, mut response: Response<R>) -> Response<R> {
        self.annotate(response.metadata_mut());
        response
    }
}

/// Applies a [`RateLimiter`] in front of tonic handlers.
#[derive(Debug, Clone)]
pub struct RateLimitGuard {
    limiter: Arc<RateLimiter>,
    errors: StatusErrorFactory,
}

impl RateLimitGuard {
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self {
            limiter,
            errors: StatusErrorFactory::default(),
        }
    }

    pub fn with_error_factory(mut self, errors: StatusErrorFactory) -> Self {
        self.errors = errors;
        self
    }

    /// Build the request context for a tonic request. ASCII metadata entries
    /// become attributes; binary entries are ignored.
    pub fn context<T>(request: &Request<T>, method: Method, operation: &str) -> RequestContext {
        let mut ctx = RequestContext::new(method, operation);

        for entry in request.metadata().iter() {
            if let KeyAndValueRef::Ascii(key, value) = entry {
                if let Ok(value) = value.to_str() {
                    ctx.insert_attribute(key.as_str(), value);
                }
            }
        }
        if let Some(addr) = request.remote_addr() {
            ctx.insert_attribute(REMOTE_ADDR_ATTRIBUTE, addr.ip().to_string());
        }

        ctx
    }

    /// Evaluate a request, turning a denial into a `RESOURCE_EXHAUSTED` status.
    ///
    /// Misconfiguration maps to `INTERNAL` and an unreachable store (when
    /// failing closed) to `UNAVAILABLE`.
    #[instrument(
        skip(self, ctx),
        fields(operation = %ctx.operation(), method = %ctx.method())
    )]
    pub async fn check(&self, ctx: &RequestContext) -> Result<Admission, Status> {
        let evaluation = self.limiter.evaluate(ctx).await.map_err(|e| {
            if e.is_configuration() {
                error!(error = %e, "Rate limiting misconfigured");
                Status::internal("rate limiting is misconfigured")
            } else {
                Status::unavailable("rate limit store unavailable")
            }
        })?;

        match evaluation {
            Evaluation::Checked(result) if !result.allowed => {
                debug!(limit = result.limit, reset = %result.reset, "Request denied");
                Err(self.errors.build(&result))
            }
            Evaluation::Checked(result) => Ok(Admission {
                result: Some(result),
            }),
            Evaluation::Skipped(_) | Evaluation::FailedOpen => Ok(Admission::default()),
        }
    }

    /// Run `handler` if the limiter admits the request, and annotate whatever
    /// it returns.
    pub async fn run<T, R, F, Fut>(
        &self,
        request: Request<T>,
        method: Method,
        operation: &str,
        handler: F,
    ) -> Result<Response<R>, Status>
    where
        F: FnOnce(Request<T>) -> Fut,
        Fut: Future<Output = Result<Response<R>, Status>>,
    {
        let ctx = Self::context(&request, method, operation);
        let admission = self.check(&ctx).await?;

        match handler(request).await {
            Ok(response) => Ok(admission.finish(response)),
            Err(mut status) => {
                admission.annotate(status.metadata_mut());
                Err(status)
            }
        }
    }
}
