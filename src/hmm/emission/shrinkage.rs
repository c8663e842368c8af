use serde::{Deserialize, Serialize};

use super::{DirectEmission, Emission, WordTable};

/// Smoothing added to each component's expected mass when the mixture
/// weights are re-estimated.
pub const SHRINKAGE_SMOOTHING: f64 = 0.0001;

/// Linear interpolation of a state's own model, the class-level parent
/// distribution and the uniform distribution over the vocabulary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShrinkageEmission {
    base: Box<Emission>,
    parent: DirectEmission,
    uniform: DirectEmission,
    /// Mixture weights for base, parent and uniform; they sum to one.
    lambda: [f64; 3],
}

impl ShrinkageEmission {
    pub fn new(base: Emission, parent: DirectEmission, uniform: DirectEmission) -> Self {
        Self { base: Box::new(base), parent, uniform, lambda: [1.0 / 3.0; 3] }
    }

    pub fn lambda(&self) -> [f64; 3] {
        self.lambda
    }

    pub fn base(&self) -> &Emission {
        &self.base
    }

    pub fn base_mut(&mut self) -> &mut Emission {
        &mut self.base
    }

    pub fn into_base(self) -> Emission {
        *self.base
    }

    pub fn set_parent(&mut self, parent: DirectEmission) {
        self.parent = parent;
    }

    pub fn set_uniform(&mut self, uniform: DirectEmission) {
        self.uniform = uniform;
    }

    /// Weighted component probabilities; they sum to `probability(word)`.
    pub fn components(&self, word: &str) -> [f64; 3] {
        [
            self.lambda[0] * self.base.probability(word),
            self.lambda[1] * self.parent.probability(word),
            self.lambda[2] * self.uniform.probability(word),
        ]
    }

    pub fn probability(&self, word: &str) -> f64 {
        self.components(word).iter().sum()
    }

    pub fn adapt(&mut self, expected: &WordTable) -> f64 {
        self.base.adapt(expected)
    }

    /// One EM step for the mixture weights given expected word counts.
    /// Returns the largest weight change.
    pub fn estimate_lambda(&mut self, expected: &WordTable) -> f64 {
        let mut beta = [SHRINKAGE_SMOOTHING; 3];
        for (w, c) in expected {
            let parts = self.components(w);
            let p: f64 = parts.iter().sum();
            if p <= 0.0 {
                continue;
            }
            for k in 0..3 {
                beta[k] += c * parts[k] / p;
            }
        }
        let total: f64 = beta.iter().sum();
        let mut change: f64 = 0.0;
        for k in 0..3 {
            let l = beta[k] / total;
            change = change.max((l - self.lambda[k]).abs());
            self.lambda[k] = l;
        }
        change
    }

    pub fn raw_distribution(&self) -> WordTable {
        let mut words = self.base.raw_distribution();
        for w in self.parent.table().keys().chain(self.uniform.table().keys()) {
            words.entry(w.clone()).or_insert(0.0);
        }
        words.into_iter().map(|(w, _)| {
            let p = self.probability(&w);
            (w, p)
        }).collect()
    }
}
