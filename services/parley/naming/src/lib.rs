//! Hierarchical names for parley endpoints.
//!
//! Every endpoint on the overlay, local or remote, is addressed by a three
//! component name written as `organization/namespace/application`, for
//! example `org/alice/v1`. Names are immutable once parsed and compare
//! component-wise.

#![warn(missing_docs)]
#![warn(clippy::all)]

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Separator between name components
pub const NAME_SEPARATOR: char = '/';

/// Number of components in a name
pub const NAME_COMPONENTS: usize = 3;

/// Name parsing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NameError {
    /// The text is not `org/namespace/app` with three non-empty components
    #[error("invalid name format '{input}': {reason}")]
    InvalidFormat {
        /// The rejected input
        input: String,
        /// Why it was rejected
        reason: &'static str,
    },
}

/// Endpoint name: (organization, namespace, application)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Name {
    organization: String,
    namespace: String,
    application: String,
}

impl Name {
    /// Build a name from its components
    pub fn new(
        organization: impl Into<String>,
        namespace: impl Into<String>,
        application: impl Into<String>,
    ) -> Result<Self, NameError> {
        let organization = organization.into();
        let namespace = namespace.into();
        let application = application.into();

        for component in [&organization, &namespace, &application] {
            if component.is_empty() {
                return Err(NameError::InvalidFormat {
                    input: format!("{}/{}/{}", organization, namespace, application),
                    reason: "empty component",
                });
            }
            if component.contains(NAME_SEPARATOR) {
                return Err(NameError::InvalidFormat {
                    input: format!("{}/{}/{}", organization, namespace, application),
                    reason: "component contains separator",
                });
            }
        }

        Ok(Self {
            organization,
            namespace,
            application,
        })
    }

    /// Parse `org/namespace/app`
    pub fn parse(s: &str) -> Result<Self, NameError> {
        let parts: Vec<&str> = s.split(NAME_SEPARATOR).collect();
        if parts.len() != NAME_COMPONENTS {
            return Err(NameError::InvalidFormat {
                input: s.to_string(),
                reason: "expected exactly 3 components",
            });
        }
        if parts.iter().any(|p| p.is_empty()) {
            return Err(NameError::InvalidFormat {
                input: s.to_string(),
                reason: "empty component",
            });
        }

        Ok(Self {
            organization: parts[0].to_string(),
            namespace: parts[1].to_string(),
            application: parts[2].to_string(),
        })
    }

    /// Organization component
    pub fn organization(&self) -> &str {
        &self.organization
    }

    /// Namespace component
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Application component
    pub fn application(&self) -> &str {
        &self.application
    }

    /// Components in order
    pub fn components(&self) -> [&str; NAME_COMPONENTS] {
        [&self.organization, &self.namespace, &self.application]
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{sep}{}{sep}{}",
            self.organization,
            self.namespace,
            self.application,
            sep = NAME_SEPARATOR
        )
    }
}

impl FromStr for Name {
    type Err = NameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Name::parse(s)
    }
}

impl Serialize for Name {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Name {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Name::parse(&s).map_err(serde::de::Error::custom)
    }
}
