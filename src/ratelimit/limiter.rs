//! Core rate limiter: resolves policy, counts, decides.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{error, info, trace, warn};

use super::backend::CounterBackend;
use super::decision::{DecisionEngine, RateLimitExceeded, RateResult};
use super::key::{AttributeIdentity, IdentityExtractor, KeyBuilder, DEFAULT_KEY_PREFIX};
use super::policy::{PolicyResolver, Resolution, SkipReason};
use super::request::RequestContext;
use super::rules::{PolicyTable, RateProvider, StaticRate};
use crate::config::{BulwarkConfig, StoreConfig};
use crate::error::{BulwarkError, Result};
use crate::store::{MemoryStore, RedisStore};

/// Default bound on a single counter store round trip.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(250);

/// What to do with a request when the counter store cannot be consulted.
///
/// Has no default. Builders and configuration files must name one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreFailureMode {
    /// Admit the request without limiting metadata
    FailOpen,
    /// Return the store error to the caller
    FailClosed,
}

/// The outcome of evaluating one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Evaluation {
    /// Limiting does not apply to this request; render nothing
    Skipped(SkipReason),
    /// The request was counted; render the result whether allowed or not
    Checked(RateResult),
    /// The store was unavailable and the limiter is configured to fail open
    FailedOpen,
}

impl Evaluation {
    /// The rate result, when the request was counted.
    pub fn rate_result(&self) -> Option<&RateResult> {
        match self {
            Evaluation::Checked(result) => Some(result),
            _ => None,
        }
    }

    /// Whether the request may proceed to its handler.
    pub fn is_allowed(&self) -> bool {
        match self {
            Evaluation::Checked(result) => result.allowed,
            Evaluation::Skipped(_) | Evaluation::FailedOpen => true,
        }
    }

    /// The over-limit condition, when the request was denied.
    pub fn exceeded(&self) -> Option<RateLimitExceeded> {
        self.rate_result().and_then(RateResult::exceeded)
    }
}

/// The rate limiter.
///
/// Holds no counting state of its own: every count lives in the
/// [`CounterBackend`], so any number of limiters (in one process or many)
/// pointing at the same store enforce the same limits.
pub struct RateLimiter {
    store: Arc<dyn CounterBackend>,
    resolver: RwLock<Arc<PolicyResolver>>,
    keys: KeyBuilder,
    engine: DecisionEngine,
    on_store_failure: StoreFailureMode,
    store_timeout: Duration,
    sweeper: Option<JoinHandle<()>>,
}

impl RateLimiter {
    /// Start building a limiter backed by `store`.
    pub fn builder(store: Arc<dyn CounterBackend>) -> RateLimiterBuilder {
        RateLimiterBuilder::new(store)
    }

    /// Build a limiter from loaded configuration.
    pub async fn from_config(config: &BulwarkConfig) -> Result<Self> {
        RateLimiterBuilder::from_config(config).await?.build()
    }

    /// Evaluate one request.
    ///
    /// Configuration errors (no identity, failing rate provider) are returned
    /// as errors before anything is counted. Denial is not an error: it is
    /// an [`Evaluation::Checked`] whose result is not allowed.
    pub async fn evaluate(&self, ctx: &RequestContext) -> Result<Evaluation> {
        // Rate providers are user code; run them without holding the lock.
        let resolver = Arc::clone(&*self.resolver.read());
        let resolution = resolver.resolve(ctx)?;

        let policy = match resolution {
            Resolution::Skip(reason) => {
                trace!(operation = %ctx.operation(), reason = ?reason, "Rate limiting skipped");
                return Ok(Evaluation::Skipped(reason));
            }
            Resolution::Apply(policy) => policy,
        };

        let key = self.keys.build(ctx, &policy.scope)?;

        trace!(
            key = %key,
            limit = policy.rate.limit(),
            window_secs = policy.rate.window_secs(),
            "Checking rate limit"
        );

        let increment = self.store.increment(&key, policy.rate.window_secs());
        let reading = match tokio::time::timeout(self.store_timeout, increment).await {
            Ok(Ok(reading)) => reading,
            Ok(Err(e)) => return self.store_failure(ctx, BulwarkError::StoreUnavailable(e)),
            Err(_) => return self.store_failure(ctx, BulwarkError::StoreTimeout(self.store_timeout)),
        };

        let result = self.engine.decide(&key, &policy.rate, &reading);
        Ok(Evaluation::Checked(result))
    }

    fn store_failure(&self, ctx: &RequestContext, err: BulwarkError) -> Result<Evaluation> {
        match self.on_store_failure {
            StoreFailureMode::FailOpen => {
                warn!(
                    operation = %ctx.operation(),
                    backend = self.store.backend_name(),
                    error = %err,
                    "Counter store unavailable, admitting request"
                );
                Ok(Evaluation::FailedOpen)
            }
            StoreFailureMode::FailClosed => {
                error!(
                    operation = %ctx.operation(),
                    backend = self.store.backend_name(),
                    error = %err,
                    "Counter store unavailable, rejecting request"
                );
                Err(err)
            }
        }
    }

    /// Replace the policy table. Requests already past resolution are unaffected.
    pub fn set_policies(&self, table: PolicyTable) {
        info!(operations = table.len(), "Replacing rate limit policies");
        Arc::make_mut(&mut *self.resolver.write()).set_table(table);
    }

    /// Get a copy of the current policy table.
    pub fn policies(&self) -> PolicyTable {
        self.resolver.read().table().clone()
    }

    pub fn on_store_failure(&self) -> StoreFailureMode {
        self.on_store_failure
    }

    pub fn store_timeout(&self) -> Duration {
        self.store_timeout
    }

    /// Whether this limiter owns a running memory store sweeper.
    pub fn has_sweeper(&self) -> bool {
        self.sweeper.as_ref().is_some_and(|sweeper| !sweeper.is_finished())
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
    }
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("backend", &self.store.backend_name())
            .field("keys", &self.keys)
            .field("on_store_failure", &self.on_store_failure)
            .field("store_timeout", &self.store_timeout)
            .field("sweeper", &self.sweeper.is_some())
            .finish_non_exhaustive()
    }
}

/// Builder for [`RateLimiter`].
pub struct RateLimiterBuilder {
    store: Arc<dyn CounterBackend>,
    identity: Option<Arc<dyn IdentityExtractor>>,
    default_rate: Option<Arc<dyn RateProvider>>,
    policies: PolicyTable,
    key_prefix: String,
    store_timeout: Duration,
    on_store_failure: Option<StoreFailureMode>,
    sweep: Option<(Arc<MemoryStore>, Duration)>,
}

impl RateLimiterBuilder {
    pub fn new(store: Arc<dyn CounterBackend>) -> Self {
        Self {
            store,
            identity: None,
            default_rate: None,
            policies: PolicyTable::new(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            store_timeout: DEFAULT_STORE_TIMEOUT,
            on_store_failure: None,
            sweep: None,
        }
    }

    /// Prepare a builder from configuration: store connection, rules file,
    /// identity attribute and default rate. Anything set here can still be
    /// overridden before [`build`](Self::build).
    ///
    /// A memory store sweeper, if configured, is started by `build` and
    /// stopped when the limiter is dropped, so `build` must then run inside
    /// a Tokio runtime.
    pub async fn from_config(config: &BulwarkConfig) -> Result<Self> {
        let mut sweep = None;
        let store: Arc<dyn CounterBackend> = match &config.store {
            StoreConfig::Memory { sweep_interval_secs } => {
                let store = Arc::new(MemoryStore::new());
                if *sweep_interval_secs > 0 {
                    sweep = Some((store.clone(), Duration::from_secs(*sweep_interval_secs)));
                }
                store
            }
            StoreConfig::Redis(redis) => Arc::new(RedisStore::connect(redis).await?),
        };

        let limiter = &config.limiter;
        let mut builder = Self::new(store)
            .key_prefix(limiter.key_prefix.clone())
            .store_timeout(Duration::from_millis(limiter.store_timeout_ms))
            .on_store_failure(limiter.on_store_failure);

        if let Some(path) = &limiter.rules_path {
            builder = builder.policies(PolicyTable::from_file(path)?);
        }
        if let Some(attribute) = &limiter.identity_attribute {
            builder = builder.identity(Arc::new(AttributeIdentity::new(attribute.clone())));
        }
        if let Some(rate) = limiter.default_rate {
            builder = builder.default_rate(Arc::new(StaticRate(rate)));
        }
        builder.sweep = sweep;

        Ok(builder)
    }

    pub fn identity(mut self, identity: Arc<dyn IdentityExtractor>) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Provider used by enabled operations that declare no rate of their own.
    pub fn default_rate(mut self, provider: Arc<dyn RateProvider>) -> Self {
        self.default_rate = Some(provider);
        self
    }

    pub fn policies(mut self, policies: PolicyTable) -> Self {
        self.policies = policies;
        self
    }

    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    pub fn on_store_failure(mut self, mode: StoreFailureMode) -> Self {
        self.on_store_failure = Some(mode);
        self
    }

    pub fn build(self) -> Result<RateLimiter> {
        let identity = self.identity.ok_or_else(|| {
            BulwarkError::Config("an identity extractor is required".to_string())
        })?;
        let on_store_failure = self.on_store_failure.ok_or_else(|| {
            BulwarkError::Config(
                "on_store_failure must be set explicitly to fail_open or fail_closed".to_string(),
            )
        })?;
        if self.store_timeout.is_zero() {
            return Err(BulwarkError::Config("store timeout must be non-zero".to_string()));
        }

        let keys = KeyBuilder::new(self.key_prefix, identity)?;
        let sweeper = self
            .sweep
            .map(|(store, interval)| store.spawn_sweeper(interval));

        info!(
            backend = self.store.backend_name(),
            operations = self.policies.len(),
            on_store_failure = ?on_store_failure,
            store_timeout = ?self.store_timeout,
            "Rate limiter initialized"
        );

        Ok(RateLimiter {
            store: self.store,
            resolver: RwLock::new(Arc::new(PolicyResolver::new(self.policies, self.default_rate))),
            keys,
            engine: DecisionEngine::new(),
            on_store_failure,
            store_timeout: self.store_timeout,
            sweeper,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::{Clock, ManualClock};
    use crate::ratelimit::counter::{CounterReading, RateConfig};
    use crate::ratelimit::key::CounterKey;
    use crate::ratelimit::request::Method;
    use crate::ratelimit::rules::{OperationPolicy, ProviderError};
    use crate::store::StoreError;
    use async_trait::async_trait;
    use chrono::TimeDelta;
    use std::sync::{OnceLock, Weak};
    use tokio_test::{assert_err, assert_ok};

    fn rate(limit: u64, window: u32) -> RateConfig {
        RateConfig::new(limit, window).unwrap()
    }

    fn request(method: Method, operation: &str, identity: &str) -> RequestContext {
        RequestContext::new(method, operation).with_attribute("x-api-key", identity)
    }

    fn limiter_with(store: Arc<dyn CounterBackend>, policies: PolicyTable) -> RateLimiter {
        RateLimiter::builder(store)
            .identity(Arc::new(AttributeIdentity::new("x-api-key")))
            .default_rate(Arc::new(StaticRate(rate(100, 60))))
            .policies(policies)
            .on_store_failure(StoreFailureMode::FailClosed)
            .build()
            .unwrap()
    }

    fn manual_limiter(policies: PolicyTable) -> (RateLimiter, ManualClock) {
        let clock = ManualClock::default();
        let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
        (limiter_with(store, policies), clock)
    }

    async fn checked(limiter: &RateLimiter, ctx: &RequestContext) -> RateResult {
        match limiter.evaluate(ctx).await.unwrap() {
            Evaluation::Checked(result) => result,
            other => panic!("expected a checked evaluation, got {:?}", other),
        }
    }

    struct FailingBackend;

    #[async_trait]
    impl CounterBackend for FailingBackend {
        async fn increment(&self, _key: &CounterKey, _window_secs: u32) -> std::result::Result<CounterReading, StoreError> {
            Err(StoreError::Connection("connection refused".to_string()))
        }

        fn backend_name(&self) -> &'static str {
            "failing"
        }
    }

    struct SlowBackend;

    #[async_trait]
    impl CounterBackend for SlowBackend {
        async fn increment(&self, _key: &CounterKey, _window_secs: u32) -> std::result::Result<CounterReading, StoreError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Err(StoreError::Command("unreachable".to_string()))
        }

        fn backend_name(&self) -> &'static str {
            "slow"
        }
    }

    #[tokio::test]
    async fn test_first_request_opens_window() {
        let (limiter, clock) = manual_limiter(PolicyTable::new().with("orders", OperationPolicy::with_rate(rate(5, 30))));

        let result = checked(&limiter, &request(Method::Get, "orders", "alice")).await;
        assert!(result.allowed);
        assert_eq!(result.limit, 5);
        assert_eq!(result.remaining, 4);
        assert_eq!(result.reset, clock.now() + TimeDelta::seconds(30));
    }

    #[tokio::test]
    async fn test_remaining_decreases_monotonically() {
        let (limiter, _clock) = manual_limiter(PolicyTable::new().with("orders", OperationPolicy::with_rate(rate(3, 60))));
        let ctx = request(Method::Post, "orders", "alice");

        let mut resets = Vec::new();
        for i in 1..=5u64 {
            let result = checked(&limiter, &ctx).await;
            assert_eq!(result.remaining, 3u64.saturating_sub(i), "request {}", i);
            assert_eq!(result.allowed, i <= 3, "request {}", i);
            resets.push(result.reset);
        }
        assert!(resets.iter().all(|r| *r == resets[0]));
    }

    #[tokio::test]
    async fn test_scenario_single_request_per_minute() {
        let (limiter, _clock) = manual_limiter(PolicyTable::new().with("orders", OperationPolicy::with_rate(rate(1, 60))));
        let ctx = request(Method::Get, "orders", "123");

        let first = checked(&limiter, &ctx).await;
        assert!(first.allowed);
        assert_eq!(first.remaining, 0);

        let second = checked(&limiter, &ctx).await;
        assert!(!second.allowed);
        assert_eq!(second.limit, 1);
        assert_eq!(second.remaining, 0);
        assert_eq!(second.reset, first.reset);
    }

    #[tokio::test]
    async fn test_scenario_window_resets_after_expiry() {
        let (limiter, clock) = manual_limiter(PolicyTable::new().with("orders", OperationPolicy::with_rate(rate(10, 1))));
        let ctx = request(Method::Get, "orders", "123");

        let first = checked(&limiter, &ctx).await;
        assert_eq!(first.remaining, 9);
        assert_eq!(first.reset, clock.now() + TimeDelta::seconds(1));

        clock.advance_secs(1);

        let second = checked(&limiter, &ctx).await;
        assert_eq!(second.remaining, 9, "a new window must not continue the old count");
        assert_eq!(second.reset, clock.now() + TimeDelta::seconds(1));
    }

    #[tokio::test]
    async fn test_scenario_window_resets_in_real_time() {
        let limiter = limiter_with(
            Arc::new(MemoryStore::new()),
            PolicyTable::new().with("orders", OperationPolicy::with_rate(rate(10, 1))),
        );
        let ctx = request(Method::Get, "orders", "123");

        assert_eq!(checked(&limiter, &ctx).await.remaining, 9);
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(checked(&limiter, &ctx).await.remaining, 9);
    }

    #[tokio::test]
    async fn test_identities_do_not_share_counts() {
        let (limiter, _clock) = manual_limiter(PolicyTable::new().with("orders", OperationPolicy::with_rate(rate(1, 60))));

        assert!(checked(&limiter, &request(Method::Get, "orders", "alice")).await.allowed);
        assert!(checked(&limiter, &request(Method::Get, "orders", "bob")).await.allowed);
        assert!(!checked(&limiter, &request(Method::Get, "orders", "alice")).await.allowed);
    }

    #[tokio::test]
    async fn test_operations_do_not_share_counts() {
        let policies = PolicyTable::new()
            .with("orders.create", OperationPolicy::with_rate(rate(1, 60)))
            .with("orders.list", OperationPolicy::with_rate(rate(5, 10)));
        let (limiter, _clock) = manual_limiter(policies);

        let create = checked(&limiter, &request(Method::Post, "orders.create", "alice")).await;
        let list = checked(&limiter, &request(Method::Get, "orders.list", "alice")).await;

        assert_eq!(create.remaining, 0);
        assert_eq!(list.remaining, 4);
        assert!(!checked(&limiter, &request(Method::Post, "orders.create", "alice")).await.allowed);
        assert!(checked(&limiter, &request(Method::Get, "orders.list", "alice")).await.allowed);
    }

    #[tokio::test]
    async fn test_group_shares_budget_across_operations() {
        let policies = PolicyTable::new()
            .with("orders.create", OperationPolicy::with_rate(rate(2, 60)).group("orders"))
            .with("orders.delete", OperationPolicy::with_rate(rate(2, 60)).group("orders"));
        let (limiter, _clock) = manual_limiter(policies);

        assert_eq!(checked(&limiter, &request(Method::Post, "orders.create", "alice")).await.remaining, 1);
        assert_eq!(checked(&limiter, &request(Method::Delete, "orders.delete", "alice")).await.remaining, 0);
        assert!(!checked(&limiter, &request(Method::Post, "orders.create", "alice")).await.allowed);
    }

    #[tokio::test]
    async fn test_exempt_methods_never_counted() {
        let (limiter, _clock) = manual_limiter(PolicyTable::new().with("orders", OperationPolicy::with_rate(rate(1, 60))));

        for _ in 0..3 {
            let evaluation = limiter.evaluate(&request(Method::Put, "orders", "alice")).await.unwrap();
            assert_eq!(evaluation, Evaluation::Skipped(SkipReason::MethodExempt(Method::Put)));
            assert!(evaluation.is_allowed());
            assert!(evaluation.rate_result().is_none());
        }

        // Skipped requests must not have consumed the budget
        assert!(checked(&limiter, &request(Method::Get, "orders", "alice")).await.allowed);
    }

    #[tokio::test]
    async fn test_disabled_operation_passes_through() {
        let (limiter, _clock) = manual_limiter(PolicyTable::new().with("orders", OperationPolicy::default()));

        for _ in 0..3 {
            let evaluation = limiter.evaluate(&request(Method::Get, "orders", "alice")).await.unwrap();
            assert_eq!(evaluation, Evaluation::Skipped(SkipReason::Disabled));
        }
    }

    #[tokio::test]
    async fn test_missing_identity_is_configuration_error() {
        let (limiter, _clock) = manual_limiter(PolicyTable::new().with("orders", OperationPolicy::enabled()));

        let anonymous = RequestContext::new(Method::Get, "orders");
        let err = assert_err!(limiter.evaluate(&anonymous).await);
        assert!(err.is_configuration());

        // An exempt request never needs an identity
        let anonymous_put = RequestContext::new(Method::Put, "orders");
        assert_ok!(limiter.evaluate(&anonymous_put).await);
    }

    #[tokio::test]
    async fn test_rate_provider_evaluated_per_request() {
        let provider = |ctx: &RequestContext| -> std::result::Result<RateConfig, ProviderError> {
            let limit = if ctx.attribute("tier") == Some("premium") { 100 } else { 1 };
            Ok(RateConfig::new(limit, 60)?)
        };
        let policies = PolicyTable::new().with("search", OperationPolicy::enabled().provider(Arc::new(provider)));
        let (limiter, _clock) = manual_limiter(policies);

        let basic = request(Method::Get, "search", "alice");
        let premium = request(Method::Get, "search", "alice").with_attribute("tier", "premium");

        assert_eq!(checked(&limiter, &basic).await.limit, 1);
        let upgraded = checked(&limiter, &premium).await;
        assert_eq!(upgraded.limit, 100);
        assert_eq!(upgraded.remaining, 98);
    }

    #[tokio::test]
    async fn test_fail_open_admits_without_result() {
        let limiter = RateLimiter::builder(Arc::new(FailingBackend))
            .identity(Arc::new(AttributeIdentity::new("x-api-key")))
            .policies(PolicyTable::new().with("orders", OperationPolicy::with_rate(rate(1, 60))))
            .on_store_failure(StoreFailureMode::FailOpen)
            .build()
            .unwrap();

        let evaluation = limiter.evaluate(&request(Method::Get, "orders", "alice")).await.unwrap();
        assert_eq!(evaluation, Evaluation::FailedOpen);
        assert!(evaluation.is_allowed());
        assert!(evaluation.rate_result().is_none());
    }

    #[tokio::test]
    async fn test_fail_closed_returns_store_error() {
        let limiter = limiter_with(
            Arc::new(FailingBackend),
            PolicyTable::new().with("orders", OperationPolicy::with_rate(rate(1, 60))),
        );

        let err = assert_err!(limiter.evaluate(&request(Method::Get, "orders", "alice")).await);
        assert!(matches!(err, BulwarkError::StoreUnavailable(_)));
    }

    #[tokio::test]
    async fn test_store_timeout_is_bounded() {
        let limiter = RateLimiter::builder(Arc::new(SlowBackend))
            .identity(Arc::new(AttributeIdentity::new("x-api-key")))
            .policies(PolicyTable::new().with("orders", OperationPolicy::with_rate(rate(1, 60))))
            .store_timeout(Duration::from_millis(20))
            .on_store_failure(StoreFailureMode::FailClosed)
            .build()
            .unwrap();

        let started = std::time::Instant::now();
        let err = assert_err!(limiter.evaluate(&request(Method::Get, "orders", "alice")).await);
        assert!(matches!(err, BulwarkError::StoreTimeout(_)));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_builder_requires_explicit_failure_mode() {
        let err = RateLimiter::builder(Arc::new(MemoryStore::new()))
            .identity(Arc::new(AttributeIdentity::new("x-api-key")))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("on_store_failure"));

        let err = RateLimiter::builder(Arc::new(MemoryStore::new()))
            .on_store_failure(StoreFailureMode::FailOpen)
            .build()
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn test_set_policies_takes_effect() {
        let (limiter, _clock) = manual_limiter(PolicyTable::new());
        let ctx = request(Method::Get, "orders", "alice");

        assert_eq!(
            limiter.evaluate(&ctx).await.unwrap(),
            Evaluation::Skipped(SkipReason::UnknownOperation)
        );

        limiter.set_policies(PolicyTable::new().with("orders", OperationPolicy::with_rate(rate(1, 60))));
        assert_eq!(limiter.policies().len(), 1);
        assert!(checked(&limiter, &ctx).await.allowed);
        assert!(!checked(&limiter, &ctx).await.allowed);
    }

    #[tokio::test]
    async fn test_from_config() {
        let yaml = r#"
limiter:
  on_store_failure: fail_open
  store_timeout_ms: 100
  identity_attribute: x-api-key
  default_rate:
    limit: 2
    window_secs: 60
store:
  backend: memory
  sweep_interval_secs: 0
"#;
        let config = BulwarkConfig::from_yaml(yaml).unwrap();
        let limiter = RateLimiter::from_config(&config).await.unwrap();
        assert_eq!(limiter.on_store_failure(), StoreFailureMode::FailOpen);
        assert_eq!(limiter.store_timeout(), Duration::from_millis(100));

        limiter.set_policies(PolicyTable::new().with("orders", OperationPolicy::enabled()));
        let result = checked(&limiter, &request(Method::Get, "orders", "alice")).await;
        assert_eq!(result.limit, 2);
        assert_eq!(result.remaining, 1);
    }

    #[tokio::test]
    async fn test_from_config_without_identity_fails() {
        let config = BulwarkConfig::from_yaml("limiter:\n  on_store_failure: fail_closed\n").unwrap();
        let err = RateLimiter::from_config(&config).await.unwrap_err();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn test_failed_build_starts_no_sweeper() {
        let config = BulwarkConfig::from_yaml(
            "limiter:\n  on_store_failure: fail_closed\nstore:\n  backend: memory\n  sweep_interval_secs: 1\n",
        )
        .unwrap();
        let builder = RateLimiterBuilder::from_config(&config).await.unwrap();
        let store = Arc::downgrade(&builder.sweep.as_ref().unwrap().0);

        assert_err!(builder.build());
        assert!(store.upgrade().is_none(), "nothing may keep the store alive");
    }

    #[tokio::test]
    async fn test_sweeper_stops_with_limiter() {
        let config = BulwarkConfig::from_yaml(
            "limiter:\n  on_store_failure: fail_closed\n  identity_attribute: x-api-key\nstore:\n  backend: memory\n  sweep_interval_secs: 1\n",
        )
        .unwrap();
        let builder = RateLimiterBuilder::from_config(&config).await.unwrap();
        let store = Arc::downgrade(&builder.sweep.as_ref().unwrap().0);

        let limiter = assert_ok!(builder.build());
        assert!(limiter.has_sweeper());
        drop(limiter);

        for _ in 0..10 {
            if store.upgrade().is_none() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(store.upgrade().is_none(), "sweeper must release the store");
    }

    #[tokio::test]
    async fn test_provider_may_swap_policies() {
        let slot: Arc<OnceLock<Weak<RateLimiter>>> = Arc::new(OnceLock::new());
        let handle = slot.clone();
        let provider = move |_: &RequestContext| -> std::result::Result<RateConfig, ProviderError> {
            if let Some(limiter) = handle.get().and_then(Weak::upgrade) {
                limiter.set_policies(limiter.policies());
            }
            Ok(RateConfig::new(5, 60)?)
        };
        let policies = PolicyTable::new().with("orders", OperationPolicy::enabled().provider(Arc::new(provider)));
        let (limiter, _clock) = manual_limiter(policies);
        let limiter = Arc::new(limiter);
        slot.set(Arc::downgrade(&limiter)).unwrap();

        let result = checked(&limiter, &request(Method::Get, "orders", "alice")).await;
        assert_eq!(result.remaining, 4);
        assert_eq!(limiter.policies().len(), 1);
    }

    #[tokio::test]
    async fn test_group_members_with_different_windows_count_separately() {
        let policies = PolicyTable::new()
            .with("reports.export", OperationPolicy::with_rate(rate(2, 3600)).group("reports"))
            .with("reports.preview", OperationPolicy::with_rate(rate(100, 1)).group("reports"));
        let (limiter, clock) = manual_limiter(policies);
        let export = request(Method::Get, "reports.export", "alice");
        let preview = request(Method::Get, "reports.preview", "alice");

        for _ in 0..50 {
            checked(&limiter, &preview).await;
        }
        let first = checked(&limiter, &export).await;
        assert!(first.allowed);
        assert_eq!(first.remaining, 1);
        assert_eq!(first.window_secs, 3600);
        assert_eq!(first.reset, clock.now() + TimeDelta::seconds(3600));

        assert_eq!(checked(&limiter, &export).await.remaining, 0);

        // The hourly budget must not come back on the per-second schedule
        clock.advance_secs(1);
        checked(&limiter, &preview).await;
        let denied = checked(&limiter, &export).await;
        assert!(!denied.allowed);
        assert_eq!(denied.reset, first.reset);
    }

    #[tokio::test]
    async fn test_limiters_sharing_a_store_share_counts() {
        let store: Arc<dyn CounterBackend> = Arc::new(MemoryStore::new());
        let policies = PolicyTable::new().with("orders", OperationPolicy::with_rate(rate(2, 60)));
        let first = limiter_with(store.clone(), policies.clone());
        let second = limiter_with(store, policies);
        let ctx = request(Method::Get, "orders", "alice");

        assert_eq!(checked(&first, &ctx).await.remaining, 1);
        assert_eq!(checked(&second, &ctx).await.remaining, 0);
        assert!(!checked(&first, &ctx).await.allowed);
    }

    #[tokio::test]
    async fn test_group_key_is_distinct_from_operation_key() {
        let policies = PolicyTable::new()
            .with("orders", OperationPolicy::with_rate(rate(1, 60)))
            .with("orders.bulk", OperationPolicy::with_rate(rate(1, 60)).group("orders"));
        let (limiter, _clock) = manual_limiter(policies);

        assert!(checked(&limiter, &request(Method::Get, "orders", "alice")).await.allowed);
        assert!(checked(&limiter, &request(Method::Get, "orders.bulk", "alice")).await.allowed);
    }
}
