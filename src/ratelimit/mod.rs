//! Rate limiting logic: policy resolution, counter keys and decisions.

mod backend;
mod clock;
mod counter;
mod decision;
mod key;
mod limiter;
mod policy;
mod request;
mod rules;

pub use backend::CounterBackend;
pub use clock::{Clock, ManualClock, SystemClock};
pub use counter::{CounterReading, RateConfig};
pub use decision::{DecisionEngine, RateLimitExceeded, RateResult};
pub use key::{AttributeIdentity, CounterKey, IdentityExtractor, KeyBuilder, Scope, DEFAULT_KEY_PREFIX};
pub use limiter::{Evaluation, RateLimiter, RateLimiterBuilder, StoreFailureMode, DEFAULT_STORE_TIMEOUT};
pub use policy::{PolicyResolver, Resolution, ResolvedPolicy, SkipReason};
pub use request::{Method, RequestContext};
pub use rules::{OperationPolicy, OperationRule, PolicyTable, ProviderError, RateProvider, RulesFile, StaticRate};
