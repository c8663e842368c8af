use crate::dataset::Token;

use super::model::SequenceModel;
use super::state::{State, BACKGROUND, FINISH, START};

/// Columns whose best score falls under this are scaled up by `RESCALE`.
const UNDERFLOW: f64 = 1e-200;
const RESCALE: f64 = 1e200;

/// Viterbi scratch space for one sequence, laid out like the lattice:
/// time 0 is the start slot and T+1 the end slot.
#[derive(Debug, Clone)]
pub struct Decoder {
    pub num_states: usize,
    pub num_times: usize,

    /// Best path score ending in state j at time t, at `num_states * t + j`.
    delta: Vec<f64>,

    /// Back pointer from (t, j) to the best state at t-1.
    psi: Vec<usize>,
}

impl Decoder {
    pub fn new(num_states: usize, len: usize) -> Self {
        let num_times = len + 2;
        Self {
            num_states,
            num_times,
            delta: vec![0.0; num_states * num_times],
            psi: vec![BACKGROUND; num_states * num_times],
        }
    }

    pub fn delta(&self, t: usize, j: usize) -> f64 {
        self.delta[self.num_states * t + j]
    }

    /// Most probable state path for `tokens`, start and end included.
    pub fn viterbi(&mut self, states: &[State], tokens: &[Token]) -> Vec<usize> {
        let L = self.num_states;
        let T = self.num_times;
        debug_assert_eq!(T, tokens.len() + 2);

        self.delta.iter_mut().for_each(|x| *x = 0.0);
        self.psi.iter_mut().for_each(|x| *x = BACKGROUND);
        self.delta[START] = 1.0;

        for t in 1..T {
            let word = if t < T - 1 { Some(tokens[t - 1].word.as_str()) } else { None };
            let mut maxmax = 0.0;
            for j in 0..L {
                let e = match word {
                    Some(w) => states[j].emission_probability(w),
                    None if j == FINISH => 1.0,
                    None => 0.0,
                };
                if e == 0.0 {
                    continue;
                }

                /* delta[t][j] = emit[t][j] * \max_{i} delta[t-1][i] * trans[i][j] */
                let mut best = 0.0;
                let mut argbest = BACKGROUND;
                for i in 0..L {
                    let score = self.delta[L * (t - 1) + i] * states[i].transition[j];
                    if best < score {
                        best = score;
                        argbest = i;
                    }
                }
                let score = best * e;
                self.delta[L * t + j] = score;
                self.psi[L * t + j] = argbest;
                if maxmax < score {
                    maxmax = score;
                }
            }

            if maxmax == 0.0 {
                log::warn!("no state path reaches time {t}; the rest of the sequence falls back to the background state");
                break;
            }
            if maxmax < UNDERFLOW {
                for j in 0..L {
                    self.delta[L * t + j] *= RESCALE;
                }
            }
        }

        let mut path = vec![START; T];
        path[T - 1] = FINISH;
        for t in (1..T - 1).rev() {
            path[t] = self.psi[L * (t + 1) + path[t + 1]];
        }
        path
    }
}

impl SequenceModel {
    /// Most probable state path for `words`, start and end included.
    pub fn best_path<S: AsRef<str>>(&self, words: &[S]) -> Vec<usize> {
        let seq = self.prepare_sequence(words);
        let mut decoder = Decoder::new(self.states.len(), seq.len());
        decoder.viterbi(&self.states, &seq.tokens)
    }

    /// Label id per word; background and unknown kinds map to 0.
    pub fn labels<S: AsRef<str>>(&self, words: &[S]) -> Vec<usize> {
        let path = self.best_path(words);
        path[1..path.len() - 1].iter().map(|&s| self.states[s].kind.max(0) as usize).collect()
    }

    pub fn label_names<S: AsRef<str>>(&self, words: &[S]) -> Vec<String> {
        self.labels(words)
            .into_iter()
            .map(|l| self.target_names.to_str(l).unwrap_or_default().to_string())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hmm::fixtures::company_model;

    #[test]
    fn decodes_company_name() {
        let model = company_model();
        let words = ["the", "acme", "corp", "of"];
        assert_eq!(model.best_path(&words), vec![START, 2, 3, 3, 2, FINISH]);
        assert_eq!(model.labels(&words), vec![0, 1, 1, 0]);
        assert_eq!(model.label_names(&words), vec!["O", "company", "company", "O"]);
    }

    #[test]
    fn empty_sequence() {
        let model = company_model();
        let words: [&str; 0] = [];
        assert_eq!(model.best_path(&words), vec![START, FINISH]);
        assert!(model.labels(&words).is_empty());
    }

    #[test]
    fn unknown_word_falls_back_to_background() {
        let model = company_model();
        let labels = model.labels(&["acme", "zzz", "corp"]);
        assert_eq!(labels.len(), 3);
        assert_eq!(labels[1], 0);
        assert_eq!(labels[2], 0);
    }

    #[test]
    fn long_sequences_do_not_underflow() {
        let model = company_model();
        let mut words = vec!["the"; 400];
        words.extend(["acme", "corp"]);
        let labels = model.labels(&words);
        assert_eq!(&labels[398..], &[0, 0, 1, 1]);
    }
}
