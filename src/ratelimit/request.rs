//! Request context handed to policy, rate and identity strategies.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Request verb, as seen by the host transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
    Other(String),
}

impl Method {
    /// Whether requests with this verb may be subject to limiting.
    ///
    /// Only reads, creates and deletes are counted. Everything else,
    /// including in-place updates, always passes through.
    pub fn is_limitable(&self) -> bool {
        matches!(self, Method::Get | Method::Post | Method::Delete)
    }

    pub fn as_str(&self) -> &str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
            Method::Other(verb) => verb,
        }
    }
}

impl FromStr for Method {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let method = match s.to_ascii_uppercase().as_str() {
            "GET" => Method::Get,
            "POST" => Method::Post,
            "PUT" => Method::Put,
            "PATCH" => Method::Patch,
            "DELETE" => Method::Delete,
            "HEAD" => Method::Head,
            "OPTIONS" => Method::Options,
            other => Method::Other(other.to_string()),
        };
        Ok(method)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything Bulwark knows about an incoming request.
///
/// Attributes carry transport data (headers, metadata, peer address) that
/// identity extractors and rate providers may inspect. Attribute names are
/// case-insensitive.
#[derive(Debug, Clone)]
pub struct RequestContext {
    method: Method,
    operation: String,
    attributes: HashMap<String, String>,
}

impl RequestContext {
    /// Create a context for a call to `operation` using `method`.
    pub fn new(method: Method, operation: impl Into<String>) -> Self {
        Self {
            method,
            operation: operation.into(),
            attributes: HashMap::new(),
        }
    }

    /// Attach an attribute, replacing any previous value.
    pub fn with_attribute(mut self, name: &str, value: impl Into<String>) -> Self {
        self.insert_attribute(name, value);
        self
    }

    pub fn insert_attribute(&mut self, name: &str, value: impl Into<String>) {
        self.attributes
            .insert(name.to_ascii_lowercase(), value.into());
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The protected operation (route) this request targets.
    pub fn operation(&self) -> &str {
        &self.operation
    }
}
