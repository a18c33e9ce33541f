//! Per-run memoization of objective values.
//!
//! The solver re-issues identical parameter vectors verbatim (the previous
//! iterate during line search, a clamped perturbation that lands on a point
//! already seen), so keys compare by the exact bit pattern of each coordinate.
//! There is no tolerance and no eviction: the cache lives for one run.

use std::collections::HashMap;

/// Exact-bit key of a parameter vector. `0.0` and `-0.0` are different keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PointKey(Box<[u64]>);

impl PointKey {
    pub fn new(x: &[f64]) -> Self {
        Self(x.iter().map(|v| v.to_bits()).collect())
    }
}

/// Objective values keyed by parameter vector, first writer wins.
#[derive(Debug, Default)]
pub struct EvaluationCache {
    values: HashMap<PointKey, f64>,
    hits: usize,
    misses: usize,
}

impl EvaluationCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached value for `x`, if this exact vector was evaluated before.
    pub fn lookup(&mut self, x: &[f64]) -> Option<f64> {
        let found = self.values.get(&PointKey::new(x)).copied();
        match found {
            Some(_) => self.hits += 1,
            None => self.misses += 1,
        }
        found
    }

    /// Store `f` for `x`. Returns `false` (and keeps the old value) if `x` is already present.
    pub fn insert(&mut self, x: &[f64], f: f64) -> bool {
        use std::collections::hash_map::Entry;
        match self.values.entry(PointKey::new(x)) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(f);
                true
            }
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn hits(&self) -> usize {
        self.hits
    }

    pub fn misses(&self) -> usize {
        self.misses
    }
}
