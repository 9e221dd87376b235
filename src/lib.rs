#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod ambiguity;
pub mod catalogue;
mod config;
mod core;
mod engine;
mod error;
mod graph;
pub mod market_data;
pub mod report;
mod utils;
pub mod value;

#[cfg(test)]
mod testing;

pub use crate::ambiguity::{
    AmbiguityChecker, AmbiguityDefect, AmbiguityKind, AmbiguityReport, ViewReport,
};
pub use crate::catalogue::{
    CatalogueCache, CompiledCatalogue, ExclusionGroupId, ExclusionGroups, Function,
    FunctionCandidate, FunctionRepository, InMemoryRepository, PriorityClass, PriorityOrdering,
    ResolvedInputs, ValuationWindow,
};
pub use crate::config::{
    CalcConfiguration, ConfigSource, InMemorySource, JsonFileSource, ViewDefinition,
};
pub use crate::core::Hash32;
pub use crate::engine::{
    Budget, BuildOptions, BuildRequest, CancelToken, Engine, EngineBuilder, RequirementSpec,
};
pub use crate::error::*;
pub use crate::graph::{DependencyGraph, DependencyNode, Producer};
pub use crate::market_data::{FixedAvailability, MarketDataAvailability, NoMarketData};
pub use crate::report::{BuildReport, FailureTrace, ResolutionException, UnsatisfiedReason};
pub use crate::value::{
    PropertySet, TargetIdentity, TargetSpecification, TargetType, ValueRequirement,
    ValueSpecification,
};

#[cfg(feature = "logging")]
pub use crate::utils::init_logging;
