pub mod dataset;
pub mod error;
pub mod hmm;
pub mod quark;

pub use dataset::{Corpus, Sequence, Token};
pub use error::{HmmError, Result};
pub use hmm::{SequenceModel, TrainOptions, TrainReport};
pub use quark::Quark;
