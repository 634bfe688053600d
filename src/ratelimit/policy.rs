//! Policy resolution: does limiting apply, and with which rate.

use std::fmt;
use std::sync::Arc;

use tracing::trace;

use super::counter::RateConfig;
use super::key::Scope;
use super::request::{Method, RequestContext};
use super::rules::{PolicyTable, RateProvider};
use crate::error::{BulwarkError, Result};

/// Why a request was not subject to limiting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// No policy is registered for the operation
    UnknownOperation,
    /// The operation's policy is not enabled
    Disabled,
    /// The verb is never limited
    MethodExempt(Method),
}

/// The outcome of policy resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Skip(SkipReason),
    Apply(ResolvedPolicy),
}

/// A policy that applies to the current request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPolicy {
    /// What the counter is shared across
    pub scope: Scope,
    /// Rate computed for this request only
    pub rate: RateConfig,
}

/// Decides whether a request is limited and computes its rate.
#[derive(Clone, Default)]
pub struct PolicyResolver {
    table: PolicyTable,
    default_rate: Option<Arc<dyn RateProvider>>,
}

impl PolicyResolver {
    pub fn new(table: PolicyTable, default_rate: Option<Arc<dyn RateProvider>>) -> Self {
        Self {
            table,
            default_rate,
        }
    }

    pub fn table(&self) -> &PolicyTable {
        &self.table
    }

    pub fn set_table(&mut self, table: PolicyTable) {
        self.table = table;
    }

    /// Resolve the policy for `ctx`.
    ///
    /// The rate provider is called on every request that qualifies and on
    /// no other; its result is never reused for a later request.
    pub fn resolve(&self, ctx: &RequestContext) -> Result<Resolution> {
        let Some(policy) = self.table.get(ctx.operation()) else {
            return Ok(Resolution::Skip(SkipReason::UnknownOperation));
        };

        if !policy.enabled {
            return Ok(Resolution::Skip(SkipReason::Disabled));
        }

        if !ctx.method().is_limitable() {
            trace!(
                operation = %ctx.operation(),
                method = %ctx.method(),
                "Method exempt from rate limiting"
            );
            return Ok(Resolution::Skip(SkipReason::MethodExempt(ctx.method().clone())));
        }

        let provider = policy
            .rate
            .as_ref()
            .or(self.default_rate.as_ref())
            .ok_or_else(|| {
                BulwarkError::Config(format!(
                    "operation `{}` is enabled but has no rate and no default rate is configured",
                    ctx.operation()
                ))
            })?;

        let rate = provider
            .rate(ctx)
            .map_err(|e| BulwarkError::RateProvider {
                operation: ctx.operation().to_string(),
                reason: e.to_string(),
            })?;

        let scope = match &policy.group {
            Some(group) => Scope::Group {
                name: group.clone(),
                window_secs: rate.window_secs(),
            },
            None => Scope::Operation(ctx.operation().to_string()),
        };

        Ok(Resolution::Apply(ResolvedPolicy { scope, rate }))
    }
}

impl fmt::Debug for PolicyResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyResolver")
            .field("table", &self.table)
            .field("has_default_rate", &self.default_rate.is_some())
            .finish()
    }
}
