//! Small hand-built models shared by unit tests.

use crate::dataset::{Corpus, Sequence};
use crate::quark::Quark;

use super::emission::{table, DirectEmission, Emission};
use super::model::SequenceModel;
use super::state::State;

/// Two emitting states over {cola, ice_t, lem}.
pub(crate) fn soda_states() -> Vec<State> {
    let cp = Emission::Direct(DirectEmission::new(table(&[("cola", 0.6), ("ice_t", 0.1), ("lem", 0.3)])));
    let ip = Emission::Direct(DirectEmission::new(table(&[("cola", 0.1), ("ice_t", 0.7), ("lem", 0.2)])));
    vec![
        State::finish(4),
        State::start(vec![0.0, 0.0, 1.0, 0.0]),
        State::new(0, Some(cp), vec![0.1, 0.0, 0.6, 0.3]),
        State::new(1, Some(ip), vec![0.1, 0.0, 0.4, 0.5]),
    ]
}

pub(crate) fn company_names() -> Quark {
    let mut names = Quark::default();
    names.find_or_insert("company");
    names
}

/// Start, end, one background and one company state with fixed tables.
pub(crate) fn company_model() -> SequenceModel {
    let bg = Emission::Direct(DirectEmission::new(table(&[("the", 0.5), ("of", 0.3), ("acme", 0.1), ("corp", 0.1)])));
    let co = Emission::Direct(DirectEmission::new(table(&[("the", 0.1), ("of", 0.1), ("acme", 0.4), ("corp", 0.4)])));
    let states = vec![
        State::finish(4),
        State::start(vec![0.0, 0.0, 0.6, 0.4]),
        State::new(0, Some(bg), vec![0.2, 0.0, 0.5, 0.3]),
        State::new(1, Some(co), vec![0.2, 0.0, 0.3, 0.5]),
    ];
    let mut model = SequenceModel::new(states, company_names()).unwrap();
    model.vocabulary = table(&[("the", 1.0), ("of", 1.0), ("acme", 1.0), ("corp", 1.0)]);
    model
}

/// `a b` as company, and `x a b y` as background, company, company, background.
pub(crate) fn company_corpus() -> Corpus {
    let mut corpus = Corpus::new(company_names());
    corpus.push(Sequence::labeled(&["a", "b"], &[1, 1]));
    corpus.push(Sequence::labeled(&["x", "a", "b", "y"], &[0, 1, 1, 0]));
    corpus
}
