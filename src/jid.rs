//! Signaling addresses (`node@domain/resource`)

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

define_parse_error!(
    /// Error returned when an address has no domain part.
    ParseJidError,
    "address"
);

/// Address of a signaling endpoint.
///
/// Calls are addressed as `call-id@domain`, components running on a call as
/// `call-id@domain/component-id`, and connection-scoped requests go to the
/// bare `domain`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Jid {
    node: Option<String>,
    domain: String,
    resource: Option<String>,
}

impl Jid {
    /// Build an address from its parts.
    pub fn new(
        node: Option<impl Into<String>>,
        domain: impl Into<String>,
        resource: Option<impl Into<String>>,
    ) -> Self {
        Self {
            node: node.map(Into::into),
            domain: domain.into(),
            resource: resource.map(Into::into),
        }
    }

    /// Bare domain address.
    pub fn domain_only(domain: impl Into<String>) -> Self {
        Self {
            node: None,
            domain: domain.into(),
            resource: None,
        }
    }

    /// `node@domain` address.
    pub fn bare(node: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            node: Some(node.into()),
            domain: domain.into(),
            resource: None,
        }
    }

    /// Local part; the call id for call-originated traffic.
    pub fn node(&self) -> Option<&str> {
        self.node
            .as_deref()
    }

    /// Domain part.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Resource part; the component id for component-originated traffic.
    pub fn resource(&self) -> Option<&str> {
        self.resource
            .as_deref()
    }

    /// Same address with the given resource.
    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(node) = &self.node {
            write!(f, "{}@", node)?;
        }
        f.write_str(&self.domain)?;
        if let Some(resource) = &self.resource {
            write!(f, "/{}", resource)?;
        }
        Ok(())
    }
}

impl FromStr for Jid {
    type Err = ParseJidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (bare, resource) = match s.split_once('/') {
            Some((bare, resource)) if !resource.is_empty() => (bare, Some(resource)),
            Some((bare, _)) => (bare, None),
            None => (s, None),
        };
        let (node, domain) = match bare.split_once('@') {
            Some((node, domain)) if !node.is_empty() => (Some(node), domain),
            Some((_, domain)) => (None, domain),
            None => (None, bare),
        };
        if domain.is_empty() {
            return Err(ParseJidError(s.to_string()));
        }
        Ok(Jid::new(node, domain, resource))
    }
}
