use std::fmt;

use serde::{Deserialize, Serialize};

/// The kind of entity a computation is performed against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TargetType {
    Primitive,
    Currency,
    Security,
    Trade,
    Position,
    PortfolioNode,
}

impl fmt::Display for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TargetType::Primitive => "PRIMITIVE",
            TargetType::Currency => "CURRENCY",
            TargetType::Security => "SECURITY",
            TargetType::Trade => "TRADE",
            TargetType::Position => "POSITION",
            TargetType::PortfolioNode => "PORTFOLIO_NODE",
        };
        f.write_str(name)
    }
}

/// Identity of a target: a scheme-qualified identifier, either referring to
/// the latest version (`version: None`) or pinned to one version.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TargetIdentity {
    pub scheme: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl TargetIdentity {
    pub fn is_latest(&self) -> bool {
        self.version.is_none()
    }
}

impl fmt::Display for TargetIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}~{}", self.scheme, self.value)?;
        if let Some(version) = &self.version {
            write!(f, "~{version}")?;
        }
        Ok(())
    }
}

/// A (target type, target identity) pair. Equality is structural.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TargetSpecification {
    #[serde(rename = "type")]
    target_type: TargetType,
    #[serde(rename = "id")]
    identity: TargetIdentity,
}

impl TargetSpecification {
    pub fn new(target_type: TargetType, identity: TargetIdentity) -> Self {
        Self {
            target_type,
            identity,
        }
    }

    /// A reference to the latest version of `scheme~value`.
    pub fn latest(
        target_type: TargetType,
        scheme: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self::new(
            target_type,
            TargetIdentity {
                scheme: scheme.into(),
                value: value.into(),
                version: None,
            },
        )
    }

    /// The same target, pinned to `version`.
    pub fn pinned(&self, version: impl Into<String>) -> Self {
        let mut pinned = self.clone();
        pinned.identity.version = Some(version.into());
        pinned
    }

    pub fn target_type(&self) -> TargetType {
        self.target_type
    }

    pub fn identity(&self) -> &TargetIdentity {
        &self.identity
    }
}

impl fmt::Display for TargetSpecification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.target_type, self.identity)
    }
}
