use serde::{Deserialize, Serialize};

use crate::dataset::Vocabulary;
use crate::hmm::features::FeatureBucketEstimator;

use super::{DirectEmission, WordTable};

/// Smoothing added to seen and unseen mass when estimating the seen probability.
pub const UNSEEN_SMOOTHING: f64 = 1.0;

const INITIAL_SEEN_PROBABILITY: f64 = 0.99;

/// Splits emission mass between known words and a feature-bucketed model of
/// words never seen in training.
///
/// A known word `w` has probability `seen * p(w)`; any other word gets
/// `(1 - seen) * p(bucket(w))`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnseenEmission {
    seen: DirectEmission,
    seen_probability: f64,
    buckets: FeatureBucketEstimator,
}

impl UnseenEmission {
    pub fn new(seen: DirectEmission, bucket_smoothing: f64) -> Self {
        Self {
            seen,
            seen_probability: INITIAL_SEEN_PROBABILITY,
            buckets: FeatureBucketEstimator::new(bucket_smoothing),
        }
    }

    pub fn probability(&self, word: &str) -> f64 {
        if self.seen.contains(word) {
            self.seen_probability * self.seen.probability(word)
        } else {
            (1.0 - self.seen_probability) * self.buckets.probability(word)
        }
    }

    pub fn seen_probability(&self) -> f64 {
        self.seen_probability
    }

    pub fn buckets(&self) -> &FeatureBucketEstimator {
        &self.buckets
    }

    pub fn adapt(&mut self, expected: &WordTable) -> f64 {
        self.seen.adapt(expected)
    }

    pub fn set(&mut self, word: &str, p: f64) -> bool {
        if self.seen_probability <= 0.0 {
            return false;
        }
        self.seen.set(word, p / self.seen_probability);
        true
    }

    pub fn raw_distribution(&self) -> WordTable {
        self.seen.table().iter().map(|(w, p)| (w.clone(), p * self.seen_probability)).collect()
    }

    pub fn normalize(&mut self) {
        self.seen.normalize();
    }

    pub fn seen(&self) -> &DirectEmission {
        &self.seen
    }

    pub fn set_buckets(&mut self, buckets: FeatureBucketEstimator) {
        self.buckets = buckets;
    }

    /// Re-derives the seen probability from the state's expected mass on
    /// frequent words and on singleton words.
    pub fn estimate_from_singletons(&mut self, seen_mass: f64, singleton_mass: f64) -> f64 {
        let before = self.seen_probability;
        self.seen_probability = smoothed_ratio(seen_mass, singleton_mass);
        (self.seen_probability - before).abs()
    }

    /// One EM step for the seen probability from expected word counts.
    ///
    /// A word counts as unseen when it is missing from `vocab`, or, with
    /// `singletons`, when it occurred at most once.
    pub fn estimate_seen_probability(&mut self, expected: &WordTable, vocab: &Vocabulary, singletons: bool) -> f64 {
        let (mut seen, mut unseen) = (0.0, 0.0);
        for (w, c) in expected {
            if is_unseen(vocab, w, singletons) {
                unseen += c;
            } else {
                seen += c;
            }
        }
        let before = self.seen_probability;
        self.seen_probability = smoothed_ratio(seen, unseen);
        (self.seen_probability - before).abs()
    }

    /// Rebuilds the buckets from expected counts of words outside `vocab`
    /// (or, with `singletons`, seen at most once).
    pub fn estimate_buckets(&mut self, expected: &WordTable, vocab: &Vocabulary, singletons: bool) {
        self.buckets.clear();
        for (w, c) in expected {
            if is_unseen(vocab, w, singletons) {
                self.buckets.add(w, *c);
            }
        }
    }
}

fn is_unseen(vocab: &Vocabulary, word: &str, singletons: bool) -> bool {
    let n = vocab.get(word).copied().unwrap_or(0.0);
    if singletons {
        n <= 1.0
    } else {
        n == 0.0
    }
}

fn smoothed_ratio(seen: f64, unseen: f64) -> f64 {
    (seen + UNSEEN_SMOOTHING) / (seen + unseen + 2.0 * UNSEEN_SMOOTHING)
}

#[cfg(test)]
mod tests {
    use super::super::table;
    use super::*;

    fn emission() -> UnseenEmission {
        UnseenEmission::new(DirectEmission::new(table(&[("acme", 0.5), ("corp", 0.5)])), 1.0)
    }

    #[test]
    fn splits_mass() {
        let mut e = emission();
        let mut fb = FeatureBucketEstimator::new(1.0);
        fb.add("Smith", 2.0);
        e.estimate_from_singletons(6.0, fb.total());
        e.set_buckets(fb);
        assert!((e.seen_probability() - 7.0 / 10.0).abs() < 1e-12);
        assert!((e.probability("acme") - 0.35).abs() < 1e-12);
        let unseen = e.probability("Jones");
        assert!((unseen - 0.3 * 3.0 / 14.0).abs() < 1e-12);
    }

    #[test]
    fn buckets_from_unseen_words() {
        let mut e = emission();
        let vocab: Vocabulary = table(&[("acme", 3.0), ("corp", 1.0)]);
        e.estimate_buckets(&table(&[("acme", 2.0), ("Zeta", 1.5), ("1999", 0.5)]), &vocab, false);
        assert_eq!(e.buckets().total(), 2.0);
        e.estimate_buckets(&table(&[("acme", 2.0), ("corp", 1.5)]), &vocab, true);
        assert_eq!(e.buckets().total(), 1.5);
    }

    #[test]
    fn held_out_estimate() {
        let mut e = emission();
        let vocab: Vocabulary = table(&[("acme", 3.0), ("corp", 1.0)]);
        e.estimate_seen_probability(&table(&[("acme", 2.0), ("zeta", 1.0)]), &vocab, false);
        assert!((e.seen_probability() - 3.0 / 5.0).abs() < 1e-12);
        e.estimate_seen_probability(&table(&[("acme", 2.0), ("corp", 1.0)]), &vocab, true);
        assert!((e.seen_probability() - 3.0 / 5.0).abs() < 1e-12);
    }

    #[test]
    fn set_round_trips() {
        let mut e = emission();
        assert!(e.set("acme", 0.2));
        assert!((e.probability("acme") - 0.2).abs() < 1e-12);
    }
}
