use serde::{Deserialize, Serialize};

use super::{max_change, WordTable};

/// Word counts over the expected visits of the last M-step. Probabilities
/// are relative counts; the keys form the state's local vocabulary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CountedEmission {
    counts: WordTable,
    /// Visits behind `counts`: replaced by `adapt`, summed by `merge`.
    mass: f64,
}

impl CountedEmission {
    pub fn new(counts: WordTable) -> Self {
        let mass = counts.values().sum();
        Self { counts, mass }
    }

    pub fn probability(&self, word: &str) -> f64 {
        if self.mass <= 0.0 {
            return 0.0;
        }
        self.counts.get(word).copied().unwrap_or(0.0) / self.mass
    }

    pub fn counts(&self) -> &WordTable {
        &self.counts
    }

    /// Expected visits the current counts were estimated from.
    pub fn mass(&self) -> f64 {
        self.mass
    }

    pub fn vocabulary(&self) -> impl Iterator<Item = &String> {
        self.counts.keys()
    }

    pub fn set(&mut self, word: &str, p: f64) -> bool {
        if self.mass <= 0.0 {
            return false;
        }
        self.counts.insert(word.to_string(), p * self.mass);
        true
    }

    /// Resets the mass to the sum of the word counts.
    pub fn normalize(&mut self) {
        self.mass = self.counts.values().sum();
    }

    fn probabilities(&self) -> WordTable {
        self.counts.keys().map(|w| (w.clone(), self.probability(w))).collect()
    }

    pub fn adapt(&mut self, expected: &WordTable) -> f64 {
        let total: f64 = expected.values().sum();
        if !(total > 0.0) {
            return 0.0;
        }
        let before = self.probabilities();
        self.counts = expected.clone();
        self.mass = total;
        max_change(&before, &self.probabilities())
    }

    /// Absorbs another state's counts. Returns the absorbed mass relative to
    /// the mass held before merging, for callers blending other parameters
    /// with the same weight.
    pub fn merge(&mut self, other: &CountedEmission) -> f64 {
        let ratio = if self.mass > 0.0 { other.mass / self.mass } else { f64::INFINITY };
        for (w, c) in &other.counts {
            *self.counts.entry(w.clone()).or_insert(0.0) += c;
        }
        self.mass += other.mass;
        ratio
    }
}
