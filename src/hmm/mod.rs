//! Hidden Markov models with a fixed topology: Baum-Welch, entropic MAP and
//! conditional training, unseen-word estimation and Viterbi decoding.

pub mod conditional;
pub mod config;
pub mod decoder;
pub mod emission;
pub mod entropic;
pub mod features;
pub mod lattice;
pub mod model;
pub mod state;
pub mod trainer;

#[cfg(test)]
pub(crate) mod fixtures;

pub use config::{Source, TrainOptions, TrainType, UnkModel, UnseenMode, UnseenStrategy};
pub use decoder::Decoder;
pub use emission::Emission;
pub use lattice::{ForwardOutcome, Lattice};
pub use model::SequenceModel;
pub use state::State;
pub use trainer::{TrainReport, TrainingEngine};
