use std::collections::BTreeMap;

use arcstr::ArcStr;
use serde::{Deserialize, Serialize};

/// A named parameter assignment.
///
/// Stage searches never share one of these mutably: each search borrows the
/// assignment it was handed and returns an updated copy. Every mutation bumps
/// [`Params::version`], so callers can tell whether a search touched the
/// assignment at all.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Params {
    #[serde(default)]
    version: u64,
    values: BTreeMap<ArcStr, f64>,
}

impl Params {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn version(&self) -> u64 {
        self.version
    }

    #[inline]
    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }

    #[inline]
    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn set(&mut self, name: impl Into<ArcStr>, value: f64) -> &mut Self {
        self.values.insert(name.into(), value);
        self.version += 1;
        self
    }

    pub fn unset(&mut self, name: &str) -> Option<f64> {
        let old = self.values.remove(name);
        if old.is_some() {
            self.version += 1;
        }
        old
    }

    /// Builder-style [`Params::set`].
    pub fn with(mut self, name: impl Into<ArcStr>, value: f64) -> Self {
        self.set(name, value);
        self
    }

    /// Copies every value of `other` into `self`, overwriting existing names.
    pub fn extend_from(&mut self, other: &Params) -> &mut Self {
        for (name, value) in other.iter() {
            self.values.insert(name.clone(), value);
        }
        if !other.values.is_empty() {
            self.version += 1;
        }
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ArcStr, f64)> {
        self.values.iter().map(|(k, v)| (k, *v))
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl<K: Into<ArcStr>> FromIterator<(K, f64)> for Params {
    fn from_iter<T: IntoIterator<Item = (K, f64)>>(iter: T) -> Self {
        let values: BTreeMap<ArcStr, f64> = iter.into_iter().map(|(k, v)| (k.into(), v)).collect();
        Self { version: 0, values }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_tracks_mutations() {
        let mut params = Params::new();
        assert_eq!(params.version(), 0);
        params.set("W_N", 10e-6).set("ID_N", 1e-3);
        assert_eq!(params.version(), 2);
        assert_eq!(params.get("W_N"), Some(10e-6));

        assert_eq!(params.unset("missing"), None);
        assert_eq!(params.version(), 2);
        assert_eq!(params.unset("W_N"), Some(10e-6));
        assert_eq!(params.version(), 3);
        assert!(!params.contains("W_N"));
    }

    #[test]
    fn test_clone_is_independent() {
        let base: Params = [("W1_N", 1e-6), ("ID1_N", 1e-3)].into_iter().collect();
        let mut copy = base.clone();
        copy.set("W1_N", 2e-6);
        assert_eq!(base.get("W1_N"), Some(1e-6));
        assert_eq!(copy.get("W1_N"), Some(2e-6));
        assert!(copy.version() > base.version());
    }

    #[test]
    fn test_extend_overwrites() {
        let mut base: Params = [("a", 1.0), ("b", 2.0)].into_iter().collect();
        let overrides: Params = [("b", 3.0), ("c", 4.0)].into_iter().collect();
        base.extend_from(&overrides);
        assert_eq!(base.get("a"), Some(1.0));
        assert_eq!(base.get("b"), Some(3.0));
        assert_eq!(base.get("c"), Some(4.0));
        assert_eq!(base.len(), 3);
    }
}
