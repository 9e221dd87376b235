use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

/// The values a single property may take.
///
/// Serialized as an optional set: a wildcard is `null`, a finite set an
/// array of strings.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "Option<BTreeSet<String>>", into = "Option<BTreeSet<String>>")]
pub enum Allowed {
    Values(BTreeSet<String>),
    Any,
}

impl From<Option<BTreeSet<String>>> for Allowed {
    fn from(values: Option<BTreeSet<String>>) -> Self {
        match values {
            Some(values) if !values.is_empty() => Allowed::Values(values),
            _ => Allowed::Any,
        }
    }
}

impl From<Allowed> for Option<BTreeSet<String>> {
    fn from(allowed: Allowed) -> Self {
        match allowed {
            Allowed::Values(values) => Some(values),
            Allowed::Any => None,
        }
    }
}

impl Allowed {
    pub fn is_any(&self) -> bool {
        matches!(self, Allowed::Any)
    }

    /// Intersection of two allowed sets, `None` when they are disjoint.
    fn intersect(&self, other: &Allowed) -> Option<Allowed> {
        match (self, other) {
            (Allowed::Any, other) | (other, Allowed::Any) => Some(other.clone()),
            (Allowed::Values(a), Allowed::Values(b)) => {
                let common: BTreeSet<String> = a.intersection(b).cloned().collect();
                (!common.is_empty()).then_some(Allowed::Values(common))
            }
        }
    }

    fn overlaps(&self, other: &Allowed) -> bool {
        match (self, other) {
            (Allowed::Any, _) | (_, Allowed::Any) => true,
            (Allowed::Values(a), Allowed::Values(b)) => a.intersection(b).next().is_some(),
        }
    }
}

/// An immutable mapping from property name to the values it may take.
///
/// Property sets appear in three roles: as the constraints of a
/// [`ValueRequirement`](crate::ValueRequirement), as the promised properties
/// of a [`ValueSpecification`](crate::ValueSpecification), and as default
/// overlays injected into top-level requirements.
///
/// Keys are kept in a `BTreeMap`, so iteration, equality, hashing and the
/// serialized form are independent of insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PropertySet {
    props: BTreeMap<String, Allowed>,
}

impl PropertySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy with `name` restricted to the given values.
    ///
    /// An empty value list is the same as [`with_any`](Self::with_any).
    pub fn with<I, S>(mut self, name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let values: BTreeSet<String> = values.into_iter().map(Into::into).collect();
        let allowed = match values.is_empty() {
            true => Allowed::Any,
            false => Allowed::Values(values),
        };
        self.props.insert(name.into(), allowed);
        self
    }

    /// Returns a copy with `name` present and accepting any value.
    pub fn with_any(mut self, name: impl Into<String>) -> Self {
        self.props.insert(name.into(), Allowed::Any);
        self
    }

    pub fn without_key(&self, name: &str) -> Self {
        let mut props = self.props.clone();
        props.remove(name);
        Self { props }
    }

    pub fn get(&self, name: &str) -> Option<&Allowed> {
        self.props.get(name)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.props.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Allowed)> {
        self.props.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn is_empty(&self) -> bool {
        self.props.is_empty()
    }

    pub fn len(&self) -> usize {
        self.props.len()
    }

    /// Per-key intersection of two property sets.
    ///
    /// Keys present on only one side are carried over unchanged. Returns
    /// `None` when a shared key has disjoint allowed values. The operation is
    /// commutative and associative.
    pub fn compose(&self, other: &PropertySet) -> Option<PropertySet> {
        let mut props = self.props.clone();

        for (key, theirs) in &other.props {
            let merged = match props.get(key) {
                Some(ours) => ours.intersect(theirs)?,
                None => theirs.clone(),
            };
            props.insert(key.clone(), merged);
        }

        Some(PropertySet { props })
    }

    /// Whether a concrete property set satisfies `self` used as constraints.
    ///
    /// Keys the concrete side doesn't carry are treated as satisfied: a
    /// producer only validates the properties it knows about.
    pub fn is_satisfied_by(&self, concrete: &PropertySet) -> bool {
        self.props.iter().all(|(key, wanted)| match concrete.props.get(key) {
            Some(offered) => wanted.overlaps(offered),
            None => true,
        })
    }

    /// Narrows `self`, used as promised properties, to the given constraints.
    ///
    /// Only keys already present in `self` are affected; a wildcard takes
    /// the constrained values. Returns `None` when the constraints can't be
    /// met.
    pub fn narrow_to(&self, constraints: &PropertySet) -> Option<PropertySet> {
        let mut props = self.props.clone();

        for (key, ours) in props.iter_mut() {
            if let Some(wanted) = constraints.props.get(key) {
                *ours = ours.intersect(wanted)?;
            }
        }

        Some(PropertySet { props })
    }

    /// Fills keys absent from `self` with the entries of `defaults`.
    pub fn with_defaults(&self, defaults: &PropertySet) -> PropertySet {
        let mut props = self.props.clone();
        for (key, value) in &defaults.props {
            props.entry(key.clone()).or_insert_with(|| value.clone());
        }
        PropertySet { props }
    }

    /// No wildcards remain.
    pub fn is_fully_resolved(&self) -> bool {
        self.props.values().all(|allowed| !allowed.is_any())
    }

    /// Orders property sets from narrowest to widest: fewer wildcards first,
    /// then fewer admissible values in total.
    pub(crate) fn breadth(&self) -> (usize, usize) {
        self.props
            .values()
            .fold((0, 0), |(wild, total), allowed| match allowed {
                Allowed::Any => (wild + 1, total),
                Allowed::Values(values) => (wild, total + values.len()),
            })
    }
}

impl fmt::Display for PropertySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (key, allowed)) in self.props.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            match allowed {
                Allowed::Any => write!(f, "{key}=*")?,
                Allowed::Values(values) => {
                    let joined: Vec<&str> = values.iter().map(String::as_str).collect();
                    write!(f, "{key}={}", joined.join("|"))?;
                }
            }
        }
        f.write_str("}")
    }
}
