//! Image spec addressing: `pool[/namespace]/name`

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

const DELIMITER: char = '/';

/// Structured location of an image (or a trash entry, where `name` is the image id)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceLocator {
    pub pool: String,
    /// Empty for the pool's default namespace
    #[serde(default)]
    pub namespace: String,
    pub name: String,
}

impl ResourceLocator {
    /// Build a locator, validating every component
    pub fn new(
        pool: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Result<Self> {
        let locator = Self {
            pool: pool.into(),
            namespace: namespace.into(),
            name: name.into(),
        };
        locator.validate()?;
        Ok(locator)
    }

    /// Build from an optional namespace, as the REST payloads carry it
    pub fn from_parts(pool: &str, namespace: Option<&str>, name: &str) -> Result<Self> {
        Self::new(pool, namespace.unwrap_or_default(), name)
    }

    /// Parse `pool/name` or `pool/namespace/name`
    pub fn parse(spec: &str) -> Result<Self> {
        let parts: Vec<&str> = spec.split(DELIMITER).collect();
        let (pool, namespace, name) = match parts.as_slice() {
            [pool, name] => (*pool, "", *name),
            [pool, namespace, name] => {
                if namespace.is_empty() {
                    return Err(Error::InvalidSpec(format!("empty namespace in '{}'", spec)));
                }
                (*pool, *namespace, *name)
            }
            _ => {
                return Err(Error::InvalidSpec(format!(
                    "'{}' must have the form pool[/namespace]/name",
                    spec
                )))
            }
        };
        if pool.is_empty() || name.is_empty() {
            return Err(Error::InvalidSpec(format!("empty pool or name in '{}'", spec)));
        }
        Ok(Self {
            pool: pool.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.pool.is_empty() {
            return Err(Error::InvalidSpec("pool cannot be empty".into()));
        }
        if self.name.is_empty() {
            return Err(Error::InvalidSpec("name cannot be empty".into()));
        }
        for part in [&self.pool, &self.namespace, &self.name] {
            if part.contains(DELIMITER) {
                return Err(Error::InvalidSpec(format!("'{}' contains '{}'", part, DELIMITER)));
            }
        }
        Ok(())
    }

    /// Same pool and namespace, different name
    pub fn with_name(&self, name: impl Into<String>) -> Self {
        Self {
            pool: self.pool.clone(),
            namespace: self.namespace.clone(),
            name: name.into(),
        }
    }

    /// `pool` or `pool/namespace`
    pub fn pool_spec(&self) -> String {
        if self.namespace.is_empty() {
            self.pool.clone()
        } else {
            format!("{}{}{}", self.pool, DELIMITER, self.namespace)
        }
    }

    pub fn namespace_opt(&self) -> Option<&str> {
        if self.namespace.is_empty() {
            None
        } else {
            Some(&self.namespace)
        }
    }
}

impl std::fmt::Display for ResourceLocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}{}", self.pool_spec(), DELIMITER, self.name)
    }
}

impl std::str::FromStr for ResourceLocator {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Format a locator from loose parts
pub fn image_spec(pool: &str, namespace: Option<&str>, name: &str) -> String {
    match namespace {
        Some(ns) if !ns.is_empty() => format!("{pool}{DELIMITER}{ns}{DELIMITER}{name}"),
        _ => format!("{pool}{DELIMITER}{name}"),
    }
}
