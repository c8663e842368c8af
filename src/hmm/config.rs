use std::fmt;
use std::str::FromStr;

use clap::Args;
use serde::{Deserialize, Serialize};

use crate::error::{HmmError, Result};

/// Relative log-likelihood change under which EM may stop.
pub const LL_CONVERGE_SIZE: f64 = 1e-8;
/// Relative decrease in log-likelihood reported as a monotonicity violation.
pub const MONOTONICITY_TOLERANCE: f64 = 1e-8;
/// Allowed drift of the per-time posterior sum.
pub const TOLERANCE: f64 = 0.001;
/// Allowed drift of a transition row sum.
pub const STOCHASTIC_TOLERANCE: f64 = 1e-4;
/// Allowed drift of an emission table sum.
pub const NORMALIZATION_TOLERANCE: f64 = 1e-5;
/// Expected counts below this are dropped before an emission M-step.
pub const PRUNE_THRESHOLD: f64 = 1e-6;
/// Iteration ceiling of the nested shrinkage/unseen loop.
pub const MAX_SHRINKAGE_ITERATIONS: usize = 20;

macro_rules! named_enum {
    ($(#[$meta:meta])* $name:ident, $what:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = HmmError;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $($text => Ok($name::$variant),)+
                    _ => Err(HmmError::InvalidConfiguration(format!("unknown {}: {s}", $what))),
                }
            }
        }
    };
}

named_enum!(
    /// How parameters are fitted.
    TrainType, "train type", {
        Joint => "joint",
        Conditional => "conditional",
        EntropicPriorMap => "entropic_prior_map",
    }
);

named_enum!(
    /// How words never seen in training are emitted.
    UnseenMode, "unseen mode", {
        Nonexistent => "nonexistent",
        UnkLowCounts => "unk_low_counts",
        HoldOutMass => "hold_out_mass",
        UseCharNgrams => "use_char_ngrams",
    }
);

named_enum!(
    /// Replacement token scheme for rare words in `unk_low_counts` mode.
    UnkModel, "unknown word model", {
        SingleUnk => "single_unk",
        FeaturalDecomp => "featural_decomp",
    }
);

named_enum!(
    /// Where unseen-word statistics come from.
    Source, "estimation source", {
        Singletons => "singletons",
        HeldOut => "held_out",
    }
);

/// Unseen-word handling stored with a trained model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UnseenStrategy {
    pub mode: UnseenMode,
    pub unk_model: UnkModel,
    pub feature_source: Source,
    pub probability_source: Source,
}

impl Default for UnseenStrategy {
    fn default() -> Self {
        TrainOptions::default().unseen_strategy()
    }
}

#[derive(Debug, Clone, PartialEq, Args, Serialize, Deserialize)]
pub struct TrainOptions {
    /// joint (Baum-Welch), conditional (L-BFGS) or entropic_prior_map (MAP EM)
    #[arg(long, default_value_t = TrainType::Joint)]
    pub train_type: TrainType,
    /// Start emissions from corpus unigram frequencies.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub init_emissions: bool,
    #[arg(long, default_value_t = UnseenMode::Nonexistent)]
    pub unseen_mode: UnseenMode,
    #[arg(long, default_value_t = UnkModel::FeaturalDecomp)]
    pub unk_model: UnkModel,
    #[arg(long, default_value_t = Source::HeldOut)]
    pub unseen_prob_source: Source,
    #[arg(long, default_value_t = Source::Singletons)]
    pub feature_source: Source,
    /// Interpolate state emissions with class and uniform distributions.
    #[arg(long)]
    pub shrinkage: bool,
    #[arg(long, default_value_t = 0.25)]
    pub held_out_fraction: f64,
    #[arg(long, default_value_t = 0.0)]
    pub pseudo_transitions: f64,
    #[arg(long, default_value_t = 0.0)]
    pub pseudo_emissions: f64,
    /// Lidstone constant of the feature buckets.
    #[arg(long, default_value_t = 1.0)]
    pub pseudo_unknowns: f64,
    #[arg(long, default_value_t = 200)]
    pub max_iterations: usize,
    #[arg(long, default_value_t = 10)]
    pub min_iterations: usize,
    #[arg(long, default_value_t = 6)]
    pub max_ngram_length: usize,
    /// Counted instead of direct emission tables.
    #[arg(long)]
    pub counted_emissions: bool,
    #[arg(long, default_value_t = 10000.0)]
    pub sigma_squared: f64,
    #[arg(long, default_value_t = 1.0)]
    pub mass_penalty: f64,
    #[arg(long, default_value_t = 1e-5)]
    pub lbfgs_epsilon: f64,
    #[arg(long, default_value_t = 100)]
    pub lbfgs_max_iterations: usize,
}

impl Default for TrainOptions {
    fn default() -> Self {
        Self {
            train_type: TrainType::Joint,
            init_emissions: true,
            unseen_mode: UnseenMode::Nonexistent,
            unk_model: UnkModel::FeaturalDecomp,
            unseen_prob_source: Source::HeldOut,
            feature_source: Source::Singletons,
            shrinkage: false,
            held_out_fraction: 0.25,
            pseudo_transitions: 0.0,
            pseudo_emissions: 0.0,
            pseudo_unknowns: 1.0,
            max_iterations: 200,
            min_iterations: 10,
            max_ngram_length: 6,
            counted_emissions: false,
            sigma_squared: 10000.0,
            mass_penalty: 1.0,
            lbfgs_epsilon: 1e-5,
            lbfgs_max_iterations: 100,
        }
    }
}

impl TrainOptions {
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| -> Result<()> { Err(HmmError::InvalidConfiguration(msg)) };
        if !(self.held_out_fraction > 0.0 && self.held_out_fraction < 1.0) {
            return invalid(format!("held_out_fraction must be in (0, 1): {}", self.held_out_fraction));
        }
        for (name, v) in [
            ("pseudo_transitions", self.pseudo_transitions),
            ("pseudo_emissions", self.pseudo_emissions),
            ("pseudo_unknowns", self.pseudo_unknowns),
            ("mass_penalty", self.mass_penalty),
        ] {
            if !(v >= 0.0) {
                return invalid(format!("{name} must be non-negative: {v}"));
            }
        }
        if !(self.sigma_squared > 0.0) {
            return invalid(format!("sigma_squared must be positive: {}", self.sigma_squared));
        }
        if self.max_ngram_length == 0 {
            return invalid("max_ngram_length must be at least 1".to_string());
        }
        if self.max_iterations == 0 {
            return invalid("max_iterations must be at least 1".to_string());
        }
        Ok(())
    }

    pub fn unseen_strategy(&self) -> UnseenStrategy {
        UnseenStrategy {
            mode: self.unseen_mode,
            unk_model: self.unk_model,
            feature_source: self.feature_source,
            probability_source: self.unseen_prob_source,
        }
    }

    /// Whether training needs a held-out split.
    pub fn needs_held_out(&self) -> bool {
        self.shrinkage
            || (self.unseen_mode == UnseenMode::HoldOutMass
                && (self.unseen_prob_source == Source::HeldOut || self.feature_source == Source::HeldOut))
    }
}
