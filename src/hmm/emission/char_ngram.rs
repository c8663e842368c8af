use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::{normalized, WordTable};

const PAD: char = '\u{2}';
const STOP: char = '\u{3}';

/// Mass given to the shorter context when interpolating.
const BACKOFF: f64 = 1.0;

/// Generates words character by character with an interpolated n-gram
/// model, so any string, seen or not, has nonzero probability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharNGramEmission {
    order: usize,
    /// context -> next character -> weight, for every context length below `order`
    counts: BTreeMap<String, BTreeMap<String, f64>>,
    totals: BTreeMap<String, f64>,
    alphabet: usize,
    source: WordTable,
}

impl CharNGramEmission {
    /// Builds a model of the given order from word weights.
    pub fn new(order: usize, words: &WordTable) -> Self {
        let mut this = Self {
            order: order.max(1),
            counts: BTreeMap::new(),
            totals: BTreeMap::new(),
            alphabet: 1,
            source: WordTable::new(),
        };
        this.fit(words);
        this
    }

    pub fn order(&self) -> usize {
        self.order
    }

    /// Word weights the model was last fitted to.
    pub fn source(&self) -> &WordTable {
        &self.source
    }

    fn fit(&mut self, words: &WordTable) {
        self.counts.clear();
        self.totals.clear();
        let mut chars = BTreeSet::new();
        chars.insert(STOP);
        for (word, &weight) in words {
            if weight <= 0.0 {
                continue;
            }
            let padded = self.pad(word);
            for i in (self.order - 1)..padded.len() {
                chars.insert(padded[i]);
                for k in 0..self.order {
                    let ctx: String = padded[i - k..i].iter().collect();
                    let next = padded[i].to_string();
                    *self.counts.entry(ctx.clone()).or_default().entry(next).or_insert(0.0) += weight;
                    *self.totals.entry(ctx).or_insert(0.0) += weight;
                }
            }
        }
        self.alphabet = chars.len();
        self.source = words.clone();
    }

    fn pad(&self, word: &str) -> Vec<char> {
        let mut padded = vec![PAD; self.order - 1];
        padded.extend(word.chars());
        padded.push(STOP);
        padded
    }

    fn char_probability(&self, history: &[char], c: char) -> f64 {
        let next = c.to_string();
        /* one extra slot in the base distribution for characters never seen */
        let mut p = 1.0 / (self.alphabet + 1) as f64;
        for k in 0..self.order {
            let ctx: String = history[history.len() - k..].iter().collect();
            let total = self.totals.get(&ctx).copied().unwrap_or(0.0);
            let count = self.counts.get(&ctx).and_then(|m| m.get(&next)).copied().unwrap_or(0.0);
            p = (count + BACKOFF * p) / (total + BACKOFF);
        }
        p
    }

    pub fn probability(&self, word: &str) -> f64 {
        let padded = self.pad(word);
        let mut p = 1.0;
        for i in (self.order - 1)..padded.len() {
            p *= self.char_probability(&padded[i + 1 - self.order..i], padded[i]);
        }
        p
    }

    /// Refits on expected counts. Returns the largest change in probability
    /// of any word carrying mass.
    pub fn adapt(&mut self, expected: &WordTable) -> f64 {
        let weights = match normalized(expected) {
            Some(t) => t,
            None => return 0.0,
        };
        let before: Vec<f64> = weights.keys().map(|w| self.probability(w)).collect();
        self.fit(&weights);
        weights
            .keys()
            .zip(before)
            .map(|(w, p)| (self.probability(w) - p).abs())
            .fold(0.0, f64::max)
    }
}

#[cfg(test)]
mod tests {
    use super::super::table;
    use super::*;

    #[test]
    fn seen_words_beat_unseen() {
        let e = CharNGramEmission::new(3, &table(&[("corp", 2.0), ("inc", 1.0), ("ltd", 1.0)]));
        let seen = e.probability("corp");
        let unseen = e.probability("zqx");
        assert!(seen > 0.0 && seen < 1.0);
        assert!(unseen > 0.0);
        assert!(seen > unseen);
    }

    #[test]
    fn unigram_probabilities_sum_over_alphabet() {
        let e = CharNGramEmission::new(1, &table(&[("ab", 1.0)]));
        // alphabet: a, b, stop (+1 unseen slot)
        let history: Vec<char> = Vec::new();
        let total: f64 = ['a', 'b', STOP].iter().map(|&c| e.char_probability(&history, c)).sum::<f64>()
            + e.char_probability(&history, 'z');
        assert!(total < 1.0 + 1e-12);
        assert!(total > 0.9);
    }

    #[test]
    fn adapt_refits() {
        let mut e = CharNGramEmission::new(2, &table(&[("aaa", 1.0)]));
        let before = e.probability("bbb");
        let change = e.adapt(&table(&[("bbb", 5.0)]));
        assert!(e.probability("bbb") > before);
        assert!(change > 0.0);
        assert_eq!(e.source().len(), 1);
    }
}
