//! Market-data availability: the oracle deciding which requirements are
//! directly observable and therefore end resolution.

use std::collections::BTreeMap;

use crate::value::{PropertySet, TargetSpecification, ValueRequirement, ValueSpecification};

pub trait MarketDataAvailability: Send + Sync {
    /// The observable specification satisfying `requirement`, if any.
    fn resolve(&self, requirement: &ValueRequirement) -> Option<ValueSpecification>;
}

/// Nothing is observable; every requirement goes through the catalogue.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoMarketData;

impl MarketDataAvailability for NoMarketData {
    fn resolve(&self, _requirement: &ValueRequirement) -> Option<ValueSpecification> {
        None
    }
}

impl<F> MarketDataAvailability for F
where
    F: Fn(&ValueRequirement) -> Option<ValueSpecification> + Send + Sync,
{
    fn resolve(&self, requirement: &ValueRequirement) -> Option<ValueSpecification> {
        self(requirement)
    }
}

/// A fixed table of observable values.
#[derive(Debug, Clone, Default)]
pub struct FixedAvailability {
    available: BTreeMap<(String, TargetSpecification), PropertySet>,
}

impl FixedAvailability {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(
        mut self,
        value_name: impl Into<String>,
        target: TargetSpecification,
        properties: PropertySet,
    ) -> Self {
        self.available.insert((value_name.into(), target), properties);
        self
    }
}

impl MarketDataAvailability for FixedAvailability {
    fn resolve(&self, requirement: &ValueRequirement) -> Option<ValueSpecification> {
        let key = (
            requirement.value_name().to_string(),
            requirement.target().clone(),
        );
        let properties = self.available.get(&key)?;

        let offered = ValueSpecification::new(
            requirement.value_name(),
            requirement.target().clone(),
            properties.clone(),
        );
        offered.narrow_to(&requirement.for_matching())
    }
}
