use std::fmt::Write as _;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::dataset::{Corpus, Sequence, Vocabulary};
use crate::error::{HmmError, Result};
use crate::quark::Quark;

use super::config::{TrainOptions, UnkModel, UnseenMode, UnseenStrategy, NORMALIZATION_TOLERANCE, STOCHASTIC_TOLERANCE};
use super::emission::{DirectEmission, Emission};
use super::features::unknown_token;
use super::lattice::{ForwardOutcome, Lattice};
use super::state::{State, BACKGROUND, FINISH, FINISH_TYPE, START, START_TYPE};
use super::trainer::{TrainReport, TrainingEngine};

/// A hidden Markov model over labeled token sequences.
///
/// State 0 is the end state, state 1 the start state and every further
/// state emits words. A state's `kind` is the label id it stands for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceModel {
    pub states: Vec<State>,
    /// Training word counts.
    pub vocabulary: Vocabulary,
    /// Label names indexed by state kind.
    pub target_names: Quark,
    /// How words outside the vocabulary are handled.
    pub unseen: UnseenStrategy,
}

impl SequenceModel {
    pub fn new(states: Vec<State>, target_names: Quark) -> Result<Self> {
        let model = Self { states, vocabulary: Vocabulary::new(), target_names, unseen: UnseenStrategy::default() };
        model.validate()?;
        Ok(model)
    }

    /// One state per label, every emitting state connected to every other
    /// emitting state and to the end, all with uniform probabilities.
    pub fn fully_connected(target_names: Quark) -> Result<Self> {
        let k = target_names.len();
        let n = k + BACKGROUND;
        let mut states = Vec::with_capacity(n);
        states.push(State::finish(n));

        let mut start = vec![0.0; n];
        for p in start.iter_mut().skip(BACKGROUND) {
            *p = 1.0 / k as f64;
        }
        states.push(State::start(start));

        let mut row = vec![1.0 / (k + 1) as f64; n];
        row[START] = 0.0;
        for kind in 0..k {
            states.push(State::new(kind as i32, Some(Emission::Direct(DirectEmission::default())), row.clone()));
        }
        Self::new(states, target_names)
    }

    pub fn num_states(&self) -> usize {
        self.states.len()
    }

    /// Checks the topology: end and start in place, square transition
    /// matrix, probabilities in range and every emitting state tied to a
    /// known label.
    pub fn validate(&self) -> Result<()> {
        let n = self.states.len();
        if n <= BACKGROUND {
            return Err(HmmError::InvalidTopology(format!("a model needs at least {} states, got {n}", BACKGROUND + 1)));
        }
        if self.states[FINISH].kind != FINISH_TYPE || self.states[START].kind != START_TYPE {
            return Err(HmmError::InvalidTopology("states 0 and 1 must be the end and start states".to_string()));
        }
        for (i, state) in self.states.iter().enumerate() {
            if state.transition.len() != n {
                return Err(HmmError::DimensionMismatch { state: i, expected: n, found: state.transition.len() });
            }
            if let Some(j) = state.transition.iter().position(|p| !(*p >= 0.0) || !p.is_finite()) {
                return Err(HmmError::InvalidTopology(format!(
                    "transition {i} -> {j} is not a probability: {}",
                    state.transition[j]
                )));
            }
            if i < BACKGROUND {
                if state.emits() {
                    return Err(HmmError::InvalidTopology(format!("state {i} cannot emit")));
                }
                continue;
            }
            if state.kind < 0 || state.kind as usize >= self.target_names.len() {
                return Err(HmmError::InvalidTopology(format!("state {i} has unknown kind {}", state.kind)));
            }
            if !state.emits() {
                return Err(HmmError::InvalidTopology(format!("state {i} has no emission")));
            }
        }
        Ok(())
    }

    pub fn state_name(&self, i: usize) -> String {
        match i {
            FINISH => "end".to_string(),
            START => "start".to_string(),
            _ => {
                let kind = self.states.get(i).map(|s| s.kind).unwrap_or(-1);
                let name = if kind >= 0 { self.target_names.to_str(kind as usize) } else { None };
                format!("{}:{}", i, name.unwrap_or("?"))
            }
        }
    }

    /// Maps a word the model has never seen to its unknown-word token when
    /// training collapsed rare words.
    pub fn prepare_word(&self, word: &str) -> String {
        if self.unseen.mode == UnseenMode::UnkLowCounts && !self.vocabulary.contains_key(word) {
            unknown_token(word, self.unseen.unk_model == UnkModel::FeaturalDecomp)
        } else {
            word.to_string()
        }
    }

    pub fn prepare_sequence<S: AsRef<str>>(&self, words: &[S]) -> Sequence {
        let mut seq = Sequence::default();
        for w in words {
            seq.push(&self.prepare_word(w.as_ref()), None);
        }
        seq
    }

    fn prepare_labeled(&self, seq: &Sequence) -> Sequence {
        let mut out = Sequence::default();
        for t in &seq.tokens {
            out.push(&self.prepare_word(&t.word), t.label);
        }
        out
    }

    fn forward(&self, seq: &Sequence, restricted: bool) -> ForwardOutcome {
        let seq = self.prepare_labeled(seq);
        let mut lattice = Lattice::new(self.states.len(), seq.len(), true, restricted);
        lattice.forward(&self.states, &seq.tokens)
    }

    /// Joint log-likelihood of words and labels, skipping sequences the
    /// model cannot generate.
    pub fn log_likelihood(&self, corpus: &Corpus) -> f64 {
        corpus.iter().filter_map(|seq| self.forward(seq, true).log_likelihood()).sum()
    }

    /// Log-likelihood of the words alone.
    pub fn log_marginal_likelihood(&self, corpus: &Corpus) -> f64 {
        corpus.iter().filter_map(|seq| self.forward(seq, false).log_likelihood()).sum()
    }

    /// Sum over sequences of log P(words, labels) - log P(words).
    pub fn log_conditional_likelihood(&self, corpus: &Corpus) -> f64 {
        let mut total = 0.0;
        for seq in corpus.iter() {
            if let (Some(r), Some(u)) =
                (self.forward(seq, true).log_likelihood(), self.forward(seq, false).log_likelihood())
            {
                total += r - u;
            }
        }
        total
    }

    /// Number of nonzero transitions and emission parameters.
    pub fn num_parameters(&self) -> usize {
        let mut k = 0;
        for (i, state) in self.states.iter().enumerate() {
            if i == FINISH {
                continue;
            }
            k += state.transition.iter().filter(|&&p| p > 0.0).count();
            match &state.emission {
                Some(e) if !e.is_constant() => k += e.raw_distribution().values().filter(|&&p| p > 0.0).count(),
                _ => {}
            }
        }
        k
    }

    /// Description length: -log L + k/2 log N, with N the number of tokens.
    pub fn mdl_score(&self, corpus: &Corpus) -> f64 {
        let n = corpus.word_count().max(1) as f64;
        -self.log_likelihood(corpus) + 0.5 * self.num_parameters() as f64 * n.ln()
    }

    /// States whose transition row does not sum to one; each is logged.
    pub fn check_stochastic(&self) -> Vec<usize> {
        let mut bad = Vec::new();
        for (i, state) in self.states.iter().enumerate() {
            let sum = state.row_sum();
            if sum != 0.0 && (sum - 1.0).abs() > STOCHASTIC_TOLERANCE {
                log::warn!("transitions out of {} sum to {sum}", self.state_name(i));
                bad.push(i);
            }
        }
        bad
    }

    /// States whose emission table does not sum to one; each is logged.
    pub fn check_normalized(&self) -> Vec<usize> {
        let mut bad = Vec::new();
        for (i, state) in self.states.iter().enumerate() {
            let mass = match &state.emission {
                Some(e) => emission_mass(e),
                None => None,
            };
            if let Some(mass) = mass {
                if (mass - 1.0).abs() > NORMALIZATION_TOLERANCE {
                    log::warn!("emissions of {} sum to {mass}", self.state_name(i));
                    bad.push(i);
                }
            }
        }
        bad
    }

    pub fn train(&mut self, corpus: &Corpus, options: &TrainOptions) -> Result<TrainReport> {
        let mut engine = TrainingEngine::new(self, options.clone())?;
        engine.train(corpus)
    }

    pub fn printable_transition_matrix(&self) -> String {
        let mut s = String::new();
        let _ = write!(s, "{:>12}", "");
        for j in 0..self.states.len() {
            let _ = write!(s, " {:>12}", self.state_name(j));
        }
        s.push('\n');
        for (i, state) in self.states.iter().enumerate() {
            let _ = write!(s, "{:>12}", self.state_name(i));
            for p in &state.transition {
                let _ = write!(s, " {:>12.6}", p);
            }
            s.push('\n');
        }
        s
    }

    /// The `top` most probable words of state `i`.
    pub fn printable_emissions(&self, i: usize, top: usize) -> Result<String> {
        let state = self.states.get(i).ok_or(HmmError::UnknownState(i))?;
        let mut s = String::new();
        let e = match &state.emission {
            Some(e) => e,
            None => {
                let _ = writeln!(s, "{} (no emissions)", self.state_name(i));
                return Ok(s);
            }
        };
        let mut words: Vec<(String, f64)> = e.raw_distribution().into_iter().collect();
        words.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        let _ = writeln!(s, "{} ({}, {} words)", self.state_name(i), e.kind(), words.len());
        for (w, p) in words.iter().take(top) {
            let _ = writeln!(s, "  {:<20} {:.6}", w, p);
        }
        Ok(s)
    }

    pub fn printable_states(&self) -> String {
        let mut s = String::new();
        for (i, state) in self.states.iter().enumerate() {
            let emission = state.emission.as_ref().map(|e| e.kind()).unwrap_or("none");
            let outgoing: Vec<String> = state
                .transition
                .iter()
                .enumerate()
                .filter(|(_, &p)| p > 0.0)
                .map(|(j, p)| format!("{}={:.4}", self.state_name(j), p))
                .collect();
            let _ = writeln!(s, "{:<16} kind={:<3} emission={:<10} -> {}", self.state_name(i), state.kind, emission, outgoing.join(" "));
        }
        s
    }

    /// Unscaled forward probabilities for `words`, one row per time step.
    pub fn printable_trellis<S: AsRef<str>>(&self, words: &[S]) -> String {
        let seq = self.prepare_sequence(words);
        let mut lattice = Lattice::new(self.states.len(), seq.len(), false, false);
        let outcome = lattice.forward(&self.states, &seq.tokens);
        let mut s = String::new();
        let _ = write!(s, "{:>16}", "");
        for j in 0..self.states.len() {
            let _ = write!(s, " {:>12}", self.state_name(j));
        }
        s.push('\n');
        let last = match outcome {
            ForwardOutcome::Generated { .. } => lattice.num_times,
            ForwardOutcome::Ungeneratable { time } => time + 1,
        };
        for t in 0..last {
            let word = match t {
                0 => "<start>",
                _ if t + 1 == lattice.num_times => "<end>",
                _ => seq.tokens[t - 1].word.as_str(),
            };
            let _ = write!(s, "{:>16}", word);
            for j in 0..self.states.len() {
                let _ = write!(s, " {:>12.4e}", lattice.alpha(t, j));
            }
            s.push('\n');
        }
        if let ForwardOutcome::Ungeneratable { time } = outcome {
            let _ = writeln!(s, "cannot be generated at time {time}");
        }
        s
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(s: &str) -> Result<Self> {
        let model: SequenceModel = serde_json::from_str(s)?;
        model.validate()?;
        Ok(model)
    }

    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut w = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(&mut w, self)?;
        w.flush()?;
        Ok(())
    }

    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let model: SequenceModel = serde_json::from_reader(BufReader::new(File::open(path)?))?;
        model.validate()?;
        Ok(model)
    }

    pub fn to_bson(&self) -> Result<Vec<u8>> {
        Ok(bson::to_vec(self)?)
    }

    pub fn from_bson(buf: &[u8]) -> Result<Self> {
        let model: SequenceModel = bson::from_slice(buf)?;
        model.validate()?;
        Ok(model)
    }

    pub fn save_bson<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut f = File::create(path)?;
        f.write_all(&self.to_bson()?)?;
        Ok(())
    }

    pub fn load_bson<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut buf = Vec::new();
        File::open(path)?.read_to_end(&mut buf)?;
        Self::from_bson(&buf)
    }
}

/// Total probability mass of an emission's own table, when it has one.
fn emission_mass(e: &Emission) -> Option<f64> {
    match e {
        Emission::Direct(d) => Some(d.total()),
        Emission::Counted(c) if c.mass() > 0.0 => Some(c.counts().values().sum::<f64>() / c.mass()),
        Emission::Unseen(u) => Some(u.seen().total()),
        Emission::Shrinkage(s) => emission_mass(s.base()),
        _ => None,
    }
}
