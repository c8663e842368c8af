use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Token used in place of rare words when unknown words are collapsed.
pub const UNKNOWN_WORD: &str = "*UNK*";

bitflags! {
    /// Character classes present in a token.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Shape: u8 {
        const HAS_DIGIT = 0x01;
        const HAS_UPPER = 0x02;
        const HAS_LOWER = 0x04;
        const INIT_UPPER = 0x08;
        const HAS_OTHER = 0x10;
    }
}

const NUMBER_CLASSES: [&str; 3] = ["nonum", "alnum", "num"];
const CAP_CLASSES: [&str; 4] = ["lower", "initcap", "allcaps", "nocase"];

/// Number of feature buckets (number class x capitalization class).
pub const NUM_BUCKETS: usize = NUMBER_CLASSES.len() * CAP_CLASSES.len();

impl Shape {
    pub fn of(word: &str) -> Self {
        let mut shape = Shape::empty();
        for (i, c) in word.chars().enumerate() {
            if c.is_numeric() {
                shape |= Shape::HAS_DIGIT;
            } else if c.is_uppercase() {
                shape |= Shape::HAS_UPPER;
                if i == 0 {
                    shape |= Shape::INIT_UPPER;
                }
            } else if c.is_lowercase() {
                shape |= Shape::HAS_LOWER;
            } else {
                shape |= Shape::HAS_OTHER;
            }
        }
        shape
    }

    fn number_class(self) -> usize {
        if !self.contains(Shape::HAS_DIGIT) {
            0
        } else if self.intersects(Shape::HAS_UPPER | Shape::HAS_LOWER) {
            1
        } else {
            2
        }
    }

    fn cap_class(self) -> usize {
        if !self.intersects(Shape::HAS_UPPER | Shape::HAS_LOWER) {
            3
        } else if !self.contains(Shape::HAS_LOWER) {
            2
        } else if self.contains(Shape::INIT_UPPER) {
            1
        } else {
            0
        }
    }

    /// Bucket index in `0..NUM_BUCKETS`.
    pub fn bucket(self) -> usize {
        self.number_class() * CAP_CLASSES.len() + self.cap_class()
    }
}

pub fn bucket_of(word: &str) -> usize {
    Shape::of(word).bucket()
}

pub fn bucket_name(bucket: usize) -> String {
    let n = NUMBER_CLASSES[(bucket / CAP_CLASSES.len()) % NUMBER_CLASSES.len()];
    let c = CAP_CLASSES[bucket % CAP_CLASSES.len()];
    format!("{n}-{c}")
}

/// Replacement token for a rare or unseen word.
pub fn unknown_token(word: &str, featural: bool) -> String {
    if featural {
        format!("{}{}", UNKNOWN_WORD, bucket_name(bucket_of(word)))
    } else {
        UNKNOWN_WORD.to_string()
    }
}

/// Weighted counts of unseen words per feature bucket, with Lidstone
/// smoothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureBucketEstimator {
    counts: Vec<f64>,
    total: f64,
    smoothing: f64,
}

impl FeatureBucketEstimator {
    pub fn new(smoothing: f64) -> Self {
        Self { counts: vec![0.0; NUM_BUCKETS], total: 0.0, smoothing }
    }

    pub fn add(&mut self, word: &str, weight: f64) {
        self.counts[bucket_of(word)] += weight;
        self.total += weight;
    }

    pub fn merge(&mut self, other: &FeatureBucketEstimator) {
        for (a, b) in self.counts.iter_mut().zip(&other.counts) {
            *a += *b;
        }
        self.total += other.total;
    }

    pub fn clear(&mut self) {
        self.counts.iter_mut().for_each(|c| *c = 0.0);
        self.total = 0.0;
    }

    /// Accumulated mass over all buckets.
    pub fn total(&self) -> f64 {
        self.total
    }

    pub fn count(&self, bucket: usize) -> f64 {
        self.counts.get(bucket).copied().unwrap_or(0.0)
    }

    pub fn bucket_probability(&self, bucket: usize) -> f64 {
        let denom = self.total + self.smoothing * NUM_BUCKETS as f64;
        if denom <= 0.0 {
            return 1.0 / NUM_BUCKETS as f64;
        }
        (self.count(bucket) + self.smoothing) / denom
    }

    /// Smoothed probability of the bucket `word` falls in.
    pub fn probability(&self, word: &str) -> f64 {
        self.bucket_probability(bucket_of(word))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shapes() {
        assert_eq!(Shape::of("acme").bucket(), 0);
        assert_eq!(Shape::of("Acme").bucket(), 1);
        assert_eq!(Shape::of("IBM").bucket(), 2);
        assert_eq!(Shape::of("--").bucket(), 3);
        assert_eq!(Shape::of("B52s").bucket(), 5);
        assert_eq!(Shape::of("3:30").bucket(), 11);
        assert!(Shape::of("3:30").contains(Shape::HAS_OTHER));
        assert_eq!(bucket_name(Shape::of("3:30").bucket()), "num-nocase");
    }

    #[test]
    fn unknown_tokens() {
        assert_eq!(unknown_token("Smith", false), "*UNK*");
        assert_eq!(unknown_token("Smith", true), "*UNK*nonum-initcap");
        assert_eq!(unknown_token("1998", true), "*UNK*num-nocase");
    }

    #[test]
    fn lidstone_smoothing() {
        let mut fb = FeatureBucketEstimator::new(1.0);
        fb.add("Smith", 2.0);
        fb.add("Jones", 1.0);
        fb.add("1998", 1.0);
        let denom = 4.0 + NUM_BUCKETS as f64;
        assert!((fb.probability("Brown") - 4.0 / denom).abs() < 1e-12);
        assert!((fb.probability("42") - 2.0 / denom).abs() < 1e-12);
        assert!((fb.probability("xyz") - 1.0 / denom).abs() < 1e-12);
        let sum: f64 = (0..NUM_BUCKETS).map(|b| fb.bucket_probability(b)).sum();
        assert!((sum - 1.0).abs() < 1e-12);
    }

    #[test]
    fn empty_estimator_is_uniform() {
        let fb = FeatureBucketEstimator::new(0.0);
        assert!((fb.probability("x") - 1.0 / NUM_BUCKETS as f64).abs() < 1e-12);
    }
}
