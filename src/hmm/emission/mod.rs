//! Per-state emission models.
//!
//! Every state that emits owns one [`Emission`]. The training engine only
//! talks to the enum: `probability` in the forward/backward passes, `adapt`
//! in the M-step and `raw_distribution` for reports and merging.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

mod char_ngram;
mod counted;
mod direct;
mod shrinkage;
mod unseen;

pub use char_ngram::CharNGramEmission;
pub use counted::CountedEmission;
pub use direct::DirectEmission;
pub use shrinkage::ShrinkageEmission;
pub use unseen::UnseenEmission;

/// Word to probability (or expected count) table.
pub type WordTable = BTreeMap<String, f64>;

/// Token emitted by states that were never visited during training.
pub const GHOST_TOKEN: &str = "_GHOST_TOWN_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Emission {
    Direct(DirectEmission),
    Counted(CountedEmission),
    Constant(ConstantEmission),
    Unseen(UnseenEmission),
    Shrinkage(ShrinkageEmission),
    CharNGram(CharNGramEmission),
}

/// Always emits the same token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstantEmission {
    pub token: String,
}

impl ConstantEmission {
    pub fn new(token: &str) -> Self {
        Self { token: token.to_string() }
    }

    pub fn ghost() -> Self {
        Self::new(GHOST_TOKEN)
    }

    pub fn probability(&self, word: &str) -> f64 {
        if word == self.token {
            1.0
        } else {
            0.0
        }
    }
}

impl Emission {
    pub fn probability(&self, word: &str) -> f64 {
        match self {
            Emission::Direct(e) => e.probability(word),
            Emission::Counted(e) => e.probability(word),
            Emission::Constant(e) => e.probability(word),
            Emission::Unseen(e) => e.probability(word),
            Emission::Shrinkage(e) => e.probability(word),
            Emission::CharNGram(e) => e.probability(word),
        }
    }

    /// One M-step from expected word counts. Returns the largest change of
    /// any probability.
    pub fn adapt(&mut self, expected: &WordTable) -> f64 {
        match self {
            Emission::Direct(e) => e.adapt(expected),
            Emission::Counted(e) => e.adapt(expected),
            Emission::Constant(_) => 0.0,
            Emission::Unseen(e) => e.adapt(expected),
            Emission::Shrinkage(e) => e.adapt(expected),
            Emission::CharNGram(e) => e.adapt(expected),
        }
    }

    /// Weight per word as used for reporting and merging.
    pub fn raw_distribution(&self) -> WordTable {
        match self {
            Emission::Direct(e) => e.table().clone(),
            Emission::Counted(e) => e.counts().clone(),
            Emission::Constant(e) => std::iter::once((e.token.clone(), 1.0)).collect(),
            Emission::Unseen(e) => e.raw_distribution(),
            Emission::Shrinkage(e) => e.raw_distribution(),
            Emission::CharNGram(e) => e.source().clone(),
        }
    }

    pub fn is_constant(&self) -> bool {
        matches!(self, Emission::Constant(_))
    }

    /// True for models holding one free parameter per word.
    pub fn is_tunable(&self) -> bool {
        matches!(self, Emission::Direct(_) | Emission::Counted(_) | Emission::Unseen(_))
    }

    /// Overwrites the probability of one word. Returns false when the model
    /// has no per-word parameter to write.
    pub fn set_probability(&mut self, word: &str, p: f64) -> bool {
        match self {
            Emission::Direct(e) => {
                e.set(word, p);
                true
            }
            Emission::Counted(e) => e.set(word, p),
            Emission::Unseen(e) => e.set(word, p),
            _ => false,
        }
    }

    /// Rescales per-word parameters after they were written one by one.
    pub fn normalize(&mut self) {
        match self {
            Emission::Direct(e) => e.normalize(),
            Emission::Counted(e) => e.normalize(),
            Emission::Unseen(e) => e.normalize(),
            Emission::Shrinkage(e) => e.base_mut().normalize(),
            Emission::Constant(_) | Emission::CharNGram(_) => {}
        }
    }

    /// The unseen-word model, looking through a shrinkage wrapper.
    pub fn unseen_mut(&mut self) -> Option<&mut UnseenEmission> {
        match self {
            Emission::Unseen(e) => Some(e),
            Emission::Shrinkage(e) => e.base_mut().unseen_mut(),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Emission::Direct(_) => "direct",
            Emission::Counted(_) => "counted",
            Emission::Constant(_) => "constant",
            Emission::Unseen(_) => "unseen",
            Emission::Shrinkage(_) => "shrinkage",
            Emission::CharNGram(_) => "char-ngram",
        }
    }
}

/// Expected counts scaled to sum to one, or None when there is no mass.
pub(crate) fn normalized(expected: &WordTable) -> Option<WordTable> {
    let total: f64 = expected.values().sum();
    if !(total > 0.0) {
        return None;
    }
    Some(expected.iter().map(|(w, c)| (w.clone(), c / total)).collect())
}

/// Largest absolute difference over the union of both key sets.
pub(crate) fn max_change(old: &WordTable, new: &WordTable) -> f64 {
    let mut change: f64 = 0.0;
    for (w, p) in new {
        change = change.max((p - old.get(w).copied().unwrap_or(0.0)).abs());
    }
    for (w, p) in old {
        if !new.contains_key(w) {
            change = change.max(p.abs());
        }
    }
    change
}

#[cfg(test)]
pub(crate) fn table(entries: &[(&str, f64)]) -> WordTable {
    entries.iter().map(|(w, p)| (w.to_string(), *p)).collect()
}
