//! Replica and operation identifiers plus the per-site state vector.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Stable identifier of one replica (site).
///
/// Ordering is the UUID byte order. The integration rule relies on it to
/// break ties between concurrent inserts at the same position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SiteId(Uuid);

impl SiteId {
    /// Generate a fresh random site id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Build a site id from a fixed value. Handy for deterministic tests.
    pub fn from_u128(value: u128) -> Self {
        Self(Uuid::from_u128(value))
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for SiteId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Globally unique operation id: `(site, counter)`.
///
/// Counters start at 1 and are contiguous per site, so a state vector entry
/// of `n` means "every op of this site up to `n` has been applied".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OpId {
    pub site: SiteId,
    pub counter: u64,
}

impl OpId {
    pub fn new(site: SiteId, counter: u64) -> Self {
        Self { site, counter }
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.counter, self.site)
    }
}

/// Highest contiguous counter observed per site.
///
/// Serialized as a JSON object keyed by site UUID.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateVector(BTreeMap<SiteId, u64>);

impl StateVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter for `site`, zero when the site was never seen.
    pub fn get(&self, site: SiteId) -> u64 {
        self.0.get(&site).copied().unwrap_or(0)
    }

    /// Raise the entry for `id.site` to at least `id.counter`.
    pub fn observe(&mut self, id: OpId) {
        let entry = self.0.entry(id.site).or_insert(0);
        if id.counter > *entry {
            *entry = id.counter;
        }
    }

    /// Whether the op with this id is already covered.
    pub fn contains(&self, id: OpId) -> bool {
        id.counter <= self.get(id.site)
    }

    /// Pointwise maximum with another vector.
    pub fn merge(&mut self, other: &StateVector) {
        for (site, counter) in &other.0 {
            self.observe(OpId::new(*site, *counter));
        }
    }

    /// True when every entry of `other` is covered by `self`.
    pub fn dominates(&self, other: &StateVector) -> bool {
        other.0.iter().all(|(site, counter)| self.get(*site) >= *counter)
    }

    /// Sum of all counters, i.e. the number of ops covered.
    pub fn total(&self) -> u64 {
        self.0.values().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SiteId, &u64)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_vector_observe_is_monotonic() {
        let site = SiteId::from_u128(7);
        let mut sv = StateVector::new();
        sv.observe(OpId::new(site, 3));
        sv.observe(OpId::new(site, 2));
        assert_eq!(sv.get(site), 3);
        assert!(sv.contains(OpId::new(site, 1)));
        assert!(!sv.contains(OpId::new(site, 4)));
    }

    #[test]
    fn test_state_vector_merge_and_dominates() {
        let a = SiteId::from_u128(1);
        let b = SiteId::from_u128(2);

        let mut left = StateVector::new();
        left.observe(OpId::new(a, 5));
        let mut right = StateVector::new();
        right.observe(OpId::new(b, 2));

        assert!(!left.dominates(&right));
        left.merge(&right);
        assert!(left.dominates(&right));
        assert_eq!(left.total(), 7);
    }

    #[test]
    fn test_state_vector_json_shape() {
        let site = SiteId::from_u128(1);
        let mut sv = StateVector::new();
        sv.observe(OpId::new(site, 4));

        let json = serde_json::to_string(&sv).unwrap();
        assert_eq!(json, format!("{{\"{site}\":4}}"));

        let back: StateVector = serde_json::from_str(&json).unwrap();
        assert_eq!(back, sv);
    }

    #[test]
    fn test_site_ordering_follows_uuid() {
        assert!(SiteId::from_u128(2) > SiteId::from_u128(1));
    }
}
