use serde::{Deserialize, Serialize};

use super::{max_change, normalized, WordTable};

/// Explicit word to probability table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DirectEmission {
    table: WordTable,
}

impl DirectEmission {
    pub fn new(table: WordTable) -> Self {
        Self { table }
    }

    /// Equal mass on every word.
    pub fn uniform<'a, I: IntoIterator<Item = &'a String>>(words: I) -> Self {
        let words: Vec<&String> = words.into_iter().collect();
        if words.is_empty() {
            return Self::default();
        }
        let p = 1.0 / words.len() as f64;
        Self { table: words.into_iter().map(|w| (w.clone(), p)).collect() }
    }

    /// Relative frequencies of `counts`.
    pub fn from_counts(counts: &WordTable) -> Self {
        Self { table: normalized(counts).unwrap_or_default() }
    }

    pub fn probability(&self, word: &str) -> f64 {
        self.table.get(word).copied().unwrap_or(0.0)
    }

    pub fn contains(&self, word: &str) -> bool {
        self.table.contains_key(word)
    }

    pub fn set(&mut self, word: &str, p: f64) {
        self.table.insert(word.to_string(), p);
    }

    pub fn table(&self) -> &WordTable {
        &self.table
    }

    pub fn total(&self) -> f64 {
        self.table.values().sum()
    }

    /// Scales the table to sum to one.
    pub fn normalize(&mut self) {
        if let Some(t) = normalized(&self.table) {
            self.table = t;
        }
    }

    /// Replaces the table with the relative frequencies of `expected`.
    /// Known words that received no mass stay in the table with zero
    /// probability.
    pub fn adapt(&mut self, expected: &WordTable) -> f64 {
        let mut fresh = match normalized(expected) {
            Some(t) => t,
            None => return 0.0,
        };
        for w in self.table.keys() {
            fresh.entry(w.clone()).or_insert(0.0);
        }
        let change = max_change(&self.table, &fresh);
        self.table = fresh;
        change
    }
}
