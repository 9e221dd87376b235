use std::fmt;

use serde::{Deserialize, Serialize};

use crate::value::{Allowed, FUNCTION_PROPERTY, PropertySet, TargetSpecification};

/// A desired output: a named value on a target, with constraints that may
/// contain wildcards.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ValueRequirement {
    value_name: String,
    target: TargetSpecification,
    #[serde(default, skip_serializing_if = "PropertySet::is_empty")]
    constraints: PropertySet,
}

impl ValueRequirement {
    pub fn new(value_name: impl Into<String>, target: TargetSpecification) -> Self {
        Self {
            value_name: value_name.into(),
            target,
            constraints: PropertySet::new(),
        }
    }

    pub fn with_constraints(mut self, constraints: PropertySet) -> Self {
        self.constraints = constraints;
        self
    }

    pub fn value_name(&self) -> &str {
        &self.value_name
    }

    pub fn target(&self) -> &TargetSpecification {
        &self.target
    }

    pub fn constraints(&self) -> &PropertySet {
        &self.constraints
    }

    /// Whether the reserved `Function` constraint admits the function `id`.
    pub fn allows_function(&self, id: &str) -> bool {
        match self.constraints.get(FUNCTION_PROPERTY) {
            Some(Allowed::Values(ids)) => ids.contains(id),
            _ => true,
        }
    }

    /// The requirement as seen by output matching: without the reserved
    /// `Function` constraint.
    pub(crate) fn for_matching(&self) -> ValueRequirement {
        match self.constraints.get(FUNCTION_PROPERTY) {
            Some(_) => ValueRequirement {
                value_name: self.value_name.clone(),
                target: self.target.clone(),
                constraints: self.constraints.without_key(FUNCTION_PROPERTY),
            },
            None => self.clone(),
        }
    }
}

impl fmt::Display for ValueRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.value_name, self.target)?;
        if !self.constraints.is_empty() {
            write!(f, "{}", self.constraints)?;
        }
        Ok(())
    }
}

/// A promised output of one function on one target.
///
/// Mid-resolution the properties may still hold wildcards; a specification
/// that terminates a requirement is always fully resolved.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ValueSpecification {
    value_name: String,
    target: TargetSpecification,
    #[serde(default, skip_serializing_if = "PropertySet::is_empty")]
    properties: PropertySet,
}

impl ValueSpecification {
    pub fn new(
        value_name: impl Into<String>,
        target: TargetSpecification,
        properties: PropertySet,
    ) -> Self {
        Self {
            value_name: value_name.into(),
            target,
            properties,
        }
    }

    pub fn value_name(&self) -> &str {
        &self.value_name
    }

    pub fn target(&self) -> &TargetSpecification {
        &self.target
    }

    pub fn properties(&self) -> &PropertySet {
        &self.properties
    }

    /// Same value name and target, and properties meeting the constraints.
    pub fn satisfies(&self, requirement: &ValueRequirement) -> bool {
        self.value_name == requirement.value_name
            && self.target == requirement.target
            && requirement.constraints.is_satisfied_by(&self.properties)
    }

    /// This specification narrowed to a requirement's constraints, if it can
    /// satisfy them.
    pub fn narrow_to(&self, requirement: &ValueRequirement) -> Option<ValueSpecification> {
        if !self.satisfies(requirement) {
            return None;
        }

        let properties = self.properties.narrow_to(&requirement.constraints)?;
        Some(ValueSpecification {
            value_name: self.value_name.clone(),
            target: self.target.clone(),
            properties,
        })
    }
}

impl fmt::Display for ValueSpecification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]{}", self.value_name, self.target, self.properties)
    }
}
