//! Counter key generation.
//!
//! A counter key combines who is asking (the identity) with what they are
//! asking for (the scope), so that neither two requesters nor two
//! differently-configured operations ever share a count.

use std::fmt;
use std::sync::Arc;

use tracing::trace;

use super::request::RequestContext;
use crate::error::{BulwarkError, Result};

/// Default namespace for counter keys in the store.
pub const DEFAULT_KEY_PREFIX: &str = "bulwark";

/// What a counter is shared across.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    /// One protected operation; the default.
    Operation(String),
    /// A named budget shared by every operation that declares the group.
    ///
    /// The window is part of the scope: members resolving to different
    /// windows count separately, so a window never expires on another
    /// member's schedule.
    Group { name: String, window_secs: u32 },
}

impl Scope {
    /// Token used inside the store key. Groups and operations live in
    /// separate namespaces, so a group named like an operation never
    /// aliases it.
    pub fn token(&self) -> String {
        match self {
            Scope::Operation(name) => format!("op:{}", name),
            Scope::Group { name, window_secs } => format!("group:{}:{}", name, window_secs),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.token())
    }
}

/// Derives the requester identity from a request.
///
/// Returning `None` (or an empty string) for a request that must be limited
/// is a configuration error.
pub trait IdentityExtractor: Send + Sync {
    fn identity(&self, ctx: &RequestContext) -> Option<String>;
}

impl<F> IdentityExtractor for F
where
    F: Fn(&RequestContext) -> Option<String> + Send + Sync,
{
    fn identity(&self, ctx: &RequestContext) -> Option<String> {
        self(ctx)
    }
}

/// Reads the identity from a request attribute, such as an API key header.
#[derive(Debug, Clone)]
pub struct AttributeIdentity {
    name: String,
}

impl AttributeIdentity {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl IdentityExtractor for AttributeIdentity {
    fn identity(&self, ctx: &RequestContext) -> Option<String> {
        ctx.attribute(&self.name).map(str::to_string)
    }
}

/// A key that uniquely identifies one requester's counter for one scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey {
    /// Store namespace
    pub prefix: String,
    /// Scope token, see [`Scope::token`]
    pub scope: String,
    /// Opaque requester identity
    pub identity: String,
}

impl CounterKey {
    pub fn new(prefix: &str, scope: &Scope, identity: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            scope: scope.token(),
            identity: identity.to_string(),
        }
    }

    /// Convert to the key string used in the store.
    ///
    /// Format: `{prefix}|{scope_len}:{scope}|{identity}`. The scope is
    /// length-prefixed so that a `|` inside a scope or identity cannot make
    /// two different pairs encode to the same key.
    pub fn to_store_key(&self) -> String {
        format!(
            "{}|{}:{}|{}",
            self.prefix,
            self.scope.len(),
            self.scope,
            self.identity
        )
    }

    /// Parse a key string produced by [`CounterKey::to_store_key`].
    pub fn from_store_key(key: &str) -> Option<Self> {
        let (prefix, rest) = key.split_once('|')?;
        let (len, rest) = rest.split_once(':')?;
        let len: usize = len.parse().ok()?;

        let scope = rest.get(..len)?;
        let identity = rest.get(len..)?.strip_prefix('|')?;

        Some(Self {
            prefix: prefix.to_string(),
            scope: scope.to_string(),
            identity: identity.to_string(),
        })
    }
}

impl fmt::Display for CounterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_store_key())
    }
}

/// Builds counter keys for requests that require limiting.
#[derive(Clone)]
pub struct KeyBuilder {
    prefix: String,
    identity: Arc<dyn IdentityExtractor>,
}

impl KeyBuilder {
    /// Create a key builder. The prefix must be non-empty and free of `|`.
    pub fn new(prefix: impl Into<String>, identity: Arc<dyn IdentityExtractor>) -> Result<Self> {
        let prefix = prefix.into();
        if prefix.is_empty() || prefix.contains('|') {
            return Err(BulwarkError::Config(format!(
                "invalid key prefix `{}`: must be non-empty and must not contain `|`",
                prefix
            )));
        }
        Ok(Self { prefix, identity })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Derive the counter key for `ctx` within `scope`.
    pub fn build(&self, ctx: &RequestContext, scope: &Scope) -> Result<CounterKey> {
        let identity = self
            .identity
            .identity(ctx)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| BulwarkError::MissingIdentity {
                operation: ctx.operation().to_string(),
            })?;

        let key = CounterKey::new(&self.prefix, scope, &identity);
        trace!(key = %key, "Built counter key");
        Ok(key)
    }
}

impl fmt::Debug for KeyBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyBuilder")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::request::Method;

    fn api_key_builder() -> KeyBuilder {
        KeyBuilder::new(DEFAULT_KEY_PREFIX, Arc::new(AttributeIdentity::new("x-api-key"))).unwrap()
    }

    #[test]
    fn test_counter_key_round_trip() {
        let key = CounterKey::new("bulwark", &Scope::Operation("orders.create".to_string()), "user:123");
        let store_key = key.to_store_key();
        assert_eq!(store_key, "bulwark|16:op:orders.create|user:123");

        let parsed = CounterKey::from_store_key(&store_key).unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn test_counter_key_delimiters_do_not_collide() {
        let a = CounterKey::new("bulwark", &Scope::Operation("a|b".to_string()), "c");
        let b = CounterKey::new("bulwark", &Scope::Operation("a".to_string()), "b|c");
        assert_ne!(a.to_store_key(), b.to_store_key());

        assert_eq!(CounterKey::from_store_key(&a.to_store_key()).unwrap(), a);
        assert_eq!(CounterKey::from_store_key(&b.to_store_key()).unwrap(), b);
    }

    #[test]
    fn test_counter_key_parsing_invalid() {
        assert!(CounterKey::from_store_key("invalid").is_none());
        assert!(CounterKey::from_store_key("bulwark|x:op:a|id").is_none());
        assert!(CounterKey::from_store_key("bulwark|99:op:a|id").is_none());
        assert!(CounterKey::from_store_key("bulwark|4:op:aid").is_none());
    }

    #[test]
    fn test_group_and_operation_scopes_differ() {
        let op = Scope::Operation("orders".to_string());
        let group = Scope::Group {
            name: "orders".to_string(),
            window_secs: 60,
        };
        assert_ne!(
            CounterKey::new("p", &op, "id").to_store_key(),
            CounterKey::new("p", &group, "id").to_store_key()
        );
    }

    #[test]
    fn test_group_windows_do_not_share_keys() {
        let hourly = Scope::Group {
            name: "orders".to_string(),
            window_secs: 3600,
        };
        let per_second = Scope::Group {
            name: "orders".to_string(),
            window_secs: 1,
        };
        assert_eq!(hourly.token(), "group:orders:3600");
        assert_ne!(
            CounterKey::new("p", &hourly, "id").to_store_key(),
            CounterKey::new("p", &per_second, "id").to_store_key()
        );
    }

    #[test]
    fn test_build_partitions_identity_and_scope() {
        let builder = api_key_builder();
        let create = Scope::Operation("orders.create".to_string());
        let list = Scope::Operation("orders.list".to_string());

        let alice = RequestContext::new(Method::Post, "orders.create").with_attribute("x-api-key", "alice");
        let bob = RequestContext::new(Method::Post, "orders.create").with_attribute("x-api-key", "bob");

        let alice_create = builder.build(&alice, &create).unwrap();
        let alice_list = builder.build(&alice, &list).unwrap();
        let bob_create = builder.build(&bob, &create).unwrap();

        assert_ne!(alice_create, bob_create);
        assert_ne!(alice_create, alice_list);
        assert_eq!(alice_create, builder.build(&alice, &create).unwrap());
    }

    #[test]
    fn test_build_without_identity_is_configuration_error() {
        let builder = api_key_builder();
        let scope = Scope::Operation("orders.create".to_string());

        let anonymous = RequestContext::new(Method::Post, "orders.create");
        let err = builder.build(&anonymous, &scope).unwrap_err();
        assert!(matches!(err, BulwarkError::MissingIdentity { ref operation } if operation == "orders.create"));
        assert!(err.is_configuration());

        let empty = RequestContext::new(Method::Post, "orders.create").with_attribute("x-api-key", "");
        assert!(builder.build(&empty, &scope).is_err());
    }

    #[test]
    fn test_closure_identity_extractor() {
        let builder = KeyBuilder::new(
            "tenant",
            Arc::new(|ctx: &RequestContext| ctx.attribute("tenant").map(|t| format!("t-{}", t))),
        )
        .unwrap();
        let ctx = RequestContext::new(Method::Get, "reports").with_attribute("tenant", "42");

        let key = builder.build(&ctx, &Scope::Operation("reports".to_string())).unwrap();
        assert_eq!(key.identity, "t-42");
        assert_eq!(key.prefix, "tenant");
    }

    #[test]
    fn test_invalid_prefix_rejected() {
        let identity: Arc<dyn IdentityExtractor> = Arc::new(AttributeIdentity::new("x-api-key"));
        assert!(KeyBuilder::new("", identity.clone()).is_err());
        assert!(KeyBuilder::new("a|b", identity).is_err());
    }
}
