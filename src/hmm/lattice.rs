use crate::dataset::Token;

use super::config::TOLERANCE;
use super::state::{State, FINISH, START};

/// Result of a forward pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ForwardOutcome {
    Generated { log_likelihood: f64 },
    /// No path explains the sequence; `time` is the first dead column.
    Ungeneratable { time: usize },
}

impl ForwardOutcome {
    pub fn log_likelihood(&self) -> Option<f64> {
        match self {
            ForwardOutcome::Generated { log_likelihood } => Some(*log_likelihood),
            ForwardOutcome::Ungeneratable { .. } => None,
        }
    }
}

/// Forward/backward scratch space for one sequence.
///
/// Time 0 is the start slot, times 1..=T hold the tokens and T+1 is the
/// end slot. Matrices are stored row by row: element [t][j] lives at
/// `num_states * t + j`.
#[derive(Debug, Clone)]
pub struct Lattice {
    pub num_states: usize,
    /// Length of the sequence plus the two synthetic slots.
    pub num_times: usize,
    scaled: bool,
    restricted: bool,

    /**
     * Forward matrix.
     *  [t][j] is the probability of the first t-1 tokens and being in
     *  state j at time t, divided by the scale factors up to t when scaling.
     */
    forward: Vec<f64>,

    /**
     * Backward matrix.
     *  [t][i] is the probability of the tokens after t given state i at
     *  time t, multiplied by the scale factors after t when scaling.
     */
    backward: Vec<f64>,

    /// Inverse of each forward column sum; all ones when not scaling.
    scale: Vec<f64>,

    /**
     * Emission factors.
     *  [t][j] is the probability that state j emits the token at t, zero
     *  when the restriction forbids it. At T+1 only the end state is one.
     */
    emit: Vec<f64>,

    /// P(O) when not scaling, one otherwise.
    norm: f64,
}

impl Lattice {
    pub fn new(num_states: usize, len: usize, scaled: bool, restricted: bool) -> Self {
        let num_times = len + 2;
        let size = num_states * num_times;
        Self {
            num_states,
            num_times,
            scaled,
            restricted,
            forward: vec![0.0; size],
            backward: vec![0.0; size],
            scale: vec![1.0; num_times],
            emit: vec![0.0; size],
            norm: 1.0,
        }
    }

    pub fn is_scaled(&self) -> bool {
        self.scaled
    }

    pub fn is_restricted(&self) -> bool {
        self.restricted
    }

    #[inline]
    fn idx(&self, t: usize, j: usize) -> usize {
        self.num_states * t + j
    }

    pub fn alpha(&self, t: usize, j: usize) -> f64 {
        self.forward[self.idx(t, j)]
    }

    pub fn beta(&self, t: usize, i: usize) -> f64 {
        self.backward[self.idx(t, i)]
    }

    pub fn emission(&self, t: usize, j: usize) -> f64 {
        self.emit[self.idx(t, j)]
    }

    pub fn scale(&self, t: usize) -> f64 {
        self.scale[t]
    }

    /// Posterior probability of being in state `i` at time `t`.
    pub fn gamma(&self, t: usize, i: usize) -> f64 {
        self.alpha(t, i) * self.beta(t, i) / self.norm
    }

    /// Posterior probability of taking `i -> j` between `t` and `t+1`.
    pub fn xi(&self, t: usize, i: usize, j: usize, transition: f64) -> f64 {
        self.alpha(t, i) * transition * self.emission(t + 1, j) * self.beta(t + 1, j) * self.scale[t + 1] / self.norm
    }

    fn emission_factor(&self, state: &State, j: usize, t: usize, token: Option<&Token>) -> f64 {
        let token = match token {
            Some(token) => token,
            None => return if j == FINISH { 1.0 } else { 0.0 },
        };
        let emission = match &state.emission {
            Some(e) => e,
            None => return 0.0,
        };
        if self.restricted && !state.accepts(token.label) {
            return 0.0;
        }
        let p = emission.probability(&token.word);
        if !(p >= 0.0) || !p.is_finite() {
            log::error!("numerical instability: state {j} emits {:?} at time {t} with probability {p}", token.word);
            return 0.0;
        }
        p
    }

    /// Fills the forward matrix for `tokens`.
    pub fn forward(&mut self, states: &[State], tokens: &[Token]) -> ForwardOutcome {
        let L = self.num_states;
        let T = self.num_times;
        debug_assert_eq!(T, tokens.len() + 2);

        self.forward.iter_mut().for_each(|x| *x = 0.0);
        self.scale.iter_mut().for_each(|x| *x = 1.0);
        self.norm = 1.0;
        let start = self.idx(0, START);
        self.forward[start] = 1.0;

        for t in 1..T {
            let token = if t < T - 1 { tokens.get(t - 1) } else { None };
            for j in 0..L {
                let e = self.emission_factor(&states[j], j, t, token);
                let k = self.idx(t, j);
                self.emit[k] = e;
            }

            /* alpha[t][j] = emit[t][j] * \sum_{i} alpha[t-1][i] * trans[i][j] */
            let mut sum = 0.0;
            for j in 0..L {
                let e = self.emit[self.idx(t, j)];
                let mut a = 0.0;
                if e != 0.0 {
                    for i in 0..L {
                        a += self.forward[self.idx(t - 1, i)] * states[i].transition[j];
                    }
                    a *= e;
                }
                let k = self.idx(t, j);
                self.forward[k] = a;
                sum += a;
            }

            if sum.is_nan() {
                log::error!("numerical instability: forward column {t} sums to NaN");
            }
            if !(sum > 0.0) {
                return ForwardOutcome::Ungeneratable { time: t };
            }
            if self.scaled {
                for j in 0..L {
                    let k = self.idx(t, j);
                    self.forward[k] /= sum;
                }
                self.scale[t] = 1.0 / sum;
            }
        }

        let log_likelihood = if self.scaled {
            /* log P(O) = - \sum_{t} log(scale[t]) */
            -self.scale.iter().map(|c| c.ln()).sum::<f64>()
        } else {
            self.norm = self.alpha(T - 1, FINISH);
            self.norm.ln()
        };
        ForwardOutcome::Generated { log_likelihood }
    }

    /// Fills the backward matrix. Only meaningful after a successful forward
    /// pass on the same sequence, whose emission factors it reuses.
    pub fn backward(&mut self, states: &[State]) {
        let L = self.num_states;
        let T = self.num_times;

        for i in 0..L {
            let k = self.idx(T - 1, i);
            self.backward[k] = 1.0;
        }

        /* beta[t][i] = scale[t+1] * \sum_{j} trans[i][j] * emit[t+1][j] * beta[t+1][j] */
        for t in (0..T - 1).rev() {
            for i in 0..L {
                let mut s = 0.0;
                for j in 0..L {
                    let e = self.emit[self.idx(t + 1, j)];
                    if e != 0.0 {
                        s += states[i].transition[j] * e * self.backward[self.idx(t + 1, j)];
                    }
                }
                let k = self.idx(t, i);
                self.backward[k] = s * self.scale[t + 1];
            }
        }
    }

    /// First time step whose posteriors do not sum to one, with the sum.
    pub fn check_posteriors(&self) -> Option<(usize, f64)> {
        for t in 0..self.num_times {
            let sum: f64 = (0..self.num_states).map(|i| self.gamma(t, i)).sum();
            if (sum - 1.0).abs() > TOLERANCE {
                return Some((t, sum));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Sequence;
    use crate::hmm::fixtures::soda_states;
    use crate::hmm::state::BACKGROUND;

    #[test]
    fn scaled_matches_unscaled() {
        let states = soda_states();
        let seq = Sequence::unlabeled(&["lem", "ice_t", "cola", "cola", "lem", "ice_t"]);
        let mut scaled = Lattice::new(4, seq.len(), true, false);
        let mut plain = Lattice::new(4, seq.len(), false, false);
        let a = scaled.forward(&states, &seq.tokens).log_likelihood().unwrap();
        let b = plain.forward(&states, &seq.tokens).log_likelihood().unwrap();
        assert!((a - b).abs() < 1e-6, "{a} != {b}");
    }

    #[test]
    fn single_token_likelihood() {
        let states = soda_states();
        let seq = Sequence::unlabeled(&["cola"]);
        let mut lattice = Lattice::new(4, 1, false, false);
        let ll = lattice.forward(&states, &seq.tokens).log_likelihood().unwrap();
        // start -> CP, emit cola, CP -> end
        assert!((ll - (0.6f64 * 0.1).ln()).abs() < 1e-12);
    }

    #[test]
    fn posteriors_sum_to_one() {
        let states = soda_states();
        let seq = Sequence::unlabeled(&["lem", "ice_t", "cola"]);
        for scaled in [true, false] {
            let mut lattice = Lattice::new(4, seq.len(), scaled, false);
            assert!(lattice.forward(&states, &seq.tokens).log_likelihood().is_some());
            lattice.backward(&states);
            assert_eq!(lattice.check_posteriors(), None);
            let leaving: f64 = (0..4).map(|j| lattice.xi(1, BACKGROUND, j, states[BACKGROUND].transition[j])).sum();
            assert!((leaving - lattice.gamma(1, BACKGROUND)).abs() < 1e-9);
        }
    }

    #[test]
    fn restriction_blocks_labels() {
        let states = soda_states();
        let seq = Sequence::labeled(&["cola", "lem"], &[1, 1]);
        let mut lattice = Lattice::new(4, seq.len(), true, true);
        // start only reaches the background state, which cannot take label 1
        assert_eq!(lattice.forward(&states, &seq.tokens), ForwardOutcome::Ungeneratable { time: 1 });
        let mut lattice = Lattice::new(4, seq.len(), true, false);
        assert!(lattice.forward(&states, &seq.tokens).log_likelihood().is_some());
    }

    #[test]
    fn unknown_word_is_ungeneratable() {
        let states = soda_states();
        let seq = Sequence::unlabeled(&["cola", "pepsi"]);
        let mut lattice = Lattice::new(4, seq.len(), true, false);
        assert_eq!(lattice.forward(&states, &seq.tokens), ForwardOutcome::Ungeneratable { time: 2 });
    }
}
