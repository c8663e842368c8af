use serde::{Deserialize, Serialize};

use super::emission::Emission;

/// Index of the end state.
pub const FINISH: usize = 0;
/// Index of the start state.
pub const START: usize = 1;
/// Index of the first background state; also the fallback backpointer.
pub const BACKGROUND: usize = 2;

pub const FINISH_TYPE: i32 = -2;
pub const START_TYPE: i32 = -1;
pub const BACKGROUND_TYPE: i32 = 0;

/// One node of the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    /// -2 end, -1 start, 0 background, >= 1 target class id.
    pub kind: i32,
    /// None for start and end.
    pub emission: Option<Emission>,
    /// Outgoing probabilities indexed by destination state.
    pub transition: Vec<f64>,
}

impl State {
    pub fn new(kind: i32, emission: Option<Emission>, transition: Vec<f64>) -> Self {
        Self { kind, emission, transition }
    }

    /// End state; it only loops onto itself.
    pub fn finish(num_states: usize) -> Self {
        let mut transition = vec![0.0; num_states];
        transition[FINISH] = 1.0;
        Self { kind: FINISH_TYPE, emission: None, transition }
    }

    pub fn start(transition: Vec<f64>) -> Self {
        Self { kind: START_TYPE, emission: None, transition }
    }

    pub fn is_target(&self) -> bool {
        self.kind > BACKGROUND_TYPE
    }

    pub fn emits(&self) -> bool {
        self.emission.is_some()
    }

    /// Emits through a model training can change, i.e. not a constant.
    pub fn emits_variably(&self) -> bool {
        matches!(&self.emission, Some(e) if !e.is_constant())
    }

    /// Whether a restricted pass lets this state absorb a token with `label`.
    pub fn accepts(&self, label: Option<usize>) -> bool {
        match label {
            Some(l) => self.kind == l as i32,
            None => true,
        }
    }

    pub fn row_sum(&self) -> f64 {
        self.transition.iter().sum()
    }

    pub fn emission_probability(&self, word: &str) -> f64 {
        self.emission.as_ref().map(|e| e.probability(word)).unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hmm::emission::{ConstantEmission, Emission};

    #[test]
    fn finish_loops() {
        let s = State::finish(4);
        assert_eq!(s.transition, vec![1.0, 0.0, 0.0, 0.0]);
        assert!(!s.emits());
        assert_eq!(s.emission_probability("x"), 0.0);
    }

    #[test]
    fn accepts_matching_labels() {
        let s = State::new(2, Some(Emission::Constant(ConstantEmission::new("x"))), vec![0.0; 3]);
        assert!(s.is_target());
        assert!(s.accepts(Some(2)));
        assert!(!s.accepts(Some(0)));
        assert!(s.accepts(None));
        assert_eq!(s.emission_probability("x"), 1.0);
    }
}
