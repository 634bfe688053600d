//! Per-operation limiting rules.
//!
//! Rules can be declared in YAML (static limits) or registered in code
//! (arbitrary [`RateProvider`]s that look at the request).

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::counter::RateConfig;
use super::request::RequestContext;
use crate::error::{BulwarkError, Result};

/// Error type returned by rate providers.
pub type ProviderError = Box<dyn std::error::Error + Send + Sync>;

/// Computes the limit and window for a request.
///
/// Providers are invoked on every qualifying request, so they may depend on
/// request content (tier, tenant, payload size).
pub trait RateProvider: Send + Sync {
    fn rate(&self, ctx: &RequestContext) -> std::result::Result<RateConfig, ProviderError>;
}

impl<F> RateProvider for F
where
    F: Fn(&RequestContext) -> std::result::Result<RateConfig, ProviderError> + Send + Sync,
{
    fn rate(&self, ctx: &RequestContext) -> std::result::Result<RateConfig, ProviderError> {
        self(ctx)
    }
}

/// A provider that always returns the same rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticRate(pub RateConfig);

impl RateProvider for StaticRate {
    fn rate(&self, _ctx: &RequestContext) -> std::result::Result<RateConfig, ProviderError> {
        Ok(self.0)
    }
}

/// Limiting policy for one protected operation.
#[derive(Clone, Default)]
pub struct OperationPolicy {
    /// Limiting only happens when this is set
    pub enabled: bool,
    /// Overrides the limiter's default provider
    pub rate: Option<Arc<dyn RateProvider>>,
    /// Share the budget with every other operation in this group
    pub group: Option<String>,
}

impl OperationPolicy {
    /// An enabled policy using the limiter's default rate.
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }

    /// An enabled policy with a fixed rate.
    pub fn with_rate(rate: RateConfig) -> Self {
        Self::enabled().provider(Arc::new(StaticRate(rate)))
    }

    pub fn provider(mut self, provider: Arc<dyn RateProvider>) -> Self {
        self.rate = Some(provider);
        self
    }

    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }
}

impl fmt::Debug for OperationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationPolicy")
            .field("enabled", &self.enabled)
            .field("has_rate_override", &self.rate.is_some())
            .field("group", &self.group)
            .finish()
    }
}

/// A rule as written in a rules file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRule {
    /// The operation (route) name
    pub name: String,
    #[serde(default)]
    pub enabled: bool,
    /// Fixed rate for this operation; the default rate applies when unset
    #[serde(default)]
    pub rate: Option<RateConfig>,
    #[serde(default)]
    pub group: Option<String>,
}

/// Rules file layout.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RulesFile {
    #[serde(default)]
    pub operations: Vec<OperationRule>,
}

impl From<OperationRule> for OperationPolicy {
    fn from(rule: OperationRule) -> Self {
        Self {
            enabled: rule.enabled,
            rate: rule
                .rate
                .map(|rate| Arc::new(StaticRate(rate)) as Arc<dyn RateProvider>),
            group: rule.group,
        }
    }
}

/// The policies of every protected operation, by operation name.
#[derive(Debug, Clone, Default)]
pub struct PolicyTable {
    operations: HashMap<String, OperationPolicy>,
}

impl PolicyTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load rules from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let file: RulesFile = serde_yaml::from_str(yaml)
            .map_err(|e| BulwarkError::Config(format!("Failed to parse rate limit rules: {}", e)))?;

        let mut table = PolicyTable::new();
        let mut group_rates: HashMap<String, (String, RateConfig)> = HashMap::new();
        for rule in file.operations {
            if table.operations.contains_key(&rule.name) {
                return Err(BulwarkError::Config(format!(
                    "duplicate rule for operation `{}`",
                    rule.name
                )));
            }
            if let (Some(group), Some(rate)) = (&rule.group, rule.rate) {
                match group_rates.get(group) {
                    Some((first, existing)) if *existing != rate => {
                        return Err(BulwarkError::Config(format!(
                            "operations `{}` and `{}` share group `{}` but declare different rates",
                            first, rule.name, group
                        )));
                    }
                    Some(_) => {}
                    None => {
                        group_rates.insert(group.clone(), (rule.name.clone(), rate));
                    }
                }
            }
            table.insert(rule.name.clone(), rule.into());
        }
        Ok(table)
    }

    /// Register or replace the policy for an operation.
    pub fn insert(&mut self, operation: impl Into<String>, policy: OperationPolicy) {
        self.operations.insert(operation.into(), policy);
    }

    /// Builder-style [`PolicyTable::insert`].
    pub fn with(mut self, operation: impl Into<String>, policy: OperationPolicy) -> Self {
        self.insert(operation, policy);
        self
    }

    pub fn get(&self, operation: &str) -> Option<&OperationPolicy> {
        self.operations.get(operation)
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}
