use std::collections::BTreeMap;

use hmmsuite::hmm::emission::{DirectEmission, Emission};
use hmmsuite::hmm::{State, TrainType, UnseenMode};
use hmmsuite::{Corpus, HmmError, Quark, Sequence, SequenceModel, TrainOptions};

const COMPANIES: &str = "\
O\tshares
O\tof
company\tAcme
company\tCorp
O\tfell

O\tthe
company\tGlobex
company\tInc
O\tsaid

O\tshares
O\tof
company\tInitech
company\tCorp
O\trose

O\tthe
company\tAcme
company\tInc
O\tsaid

O\tshares
O\tof
company\tGlobex
company\tCorp
O\tfell
";

fn init() {
    let _ = env_logger::builder().is_test(true).filter_level(log::LevelFilter::Info).try_init();
}

fn companies() -> Corpus {
    let mut corpus = Corpus::default();
    corpus.read(COMPANIES.as_bytes()).expect("failed to read corpus");
    corpus
}

fn table(entries: &[(&str, f64)]) -> BTreeMap<String, f64> {
    entries.iter().map(|(w, p)| (w.to_string(), *p)).collect()
}

#[test]
fn train_and_label() {
    init();
    let corpus = companies();
    assert_eq!(corpus.len(), 5);
    let mut model = SequenceModel::fully_connected(corpus.labels.clone()).unwrap();
    let report = model.train(&corpus, &TrainOptions::default()).unwrap();
    assert!(report.converged);
    assert_eq!(report.ungeneratable, 0);
    assert!(model.check_stochastic().is_empty());
    assert!(model.check_normalized().is_empty());
    assert_eq!(
        model.label_names(&["shares", "of", "Initech", "Inc", "fell"]),
        vec!["O", "O", "company", "company", "O"]
    );
}

#[test]
fn likelihood_never_decreases() {
    init();
    let mut names = Quark::default();
    names.find_or_insert("company");
    let a = Emission::Direct(DirectEmission::new(table(&[("x", 0.7), ("y", 0.3)])));
    let b = Emission::Direct(DirectEmission::new(table(&[("x", 0.2), ("y", 0.8)])));
    let states = vec![
        State::finish(4),
        State::start(vec![0.0, 0.0, 0.6, 0.4]),
        State::new(0, Some(a), vec![0.2, 0.0, 0.5, 0.3]),
        State::new(0, Some(b), vec![0.2, 0.0, 0.2, 0.6]),
    ];
    let mut model = SequenceModel::new(states, names.clone()).unwrap();
    let mut corpus = Corpus::new(names);
    corpus.push(Sequence::unlabeled(&["x", "y", "y"]));
    corpus.push(Sequence::unlabeled(&["x", "x", "y"]));
    corpus.push(Sequence::unlabeled(&["y", "x"]));

    let options = TrainOptions { init_emissions: false, max_iterations: 30, ..Default::default() };
    let report = model.train(&corpus, &options).unwrap();
    assert_eq!(report.monotonicity_violations, 0);
    let ll = &report.log_likelihoods;
    for k in 0..3 {
        assert!(ll[k + 1] > ll[k], "iteration {}: {} -> {}", k, ll[k], ll[k + 1]);
    }
    for w in ll.windows(2) {
        assert!(w[1] >= w[0] - 1e-8 * w[0].abs());
    }
}

#[test]
fn counted_emissions_agree_with_direct() {
    init();
    let corpus = companies();
    let words = ["the", "Acme", "Corp", "said"];
    let mut direct = SequenceModel::fully_connected(corpus.labels.clone()).unwrap();
    direct.train(&corpus, &TrainOptions::default()).unwrap();
    let mut counted = SequenceModel::fully_connected(corpus.labels.clone()).unwrap();
    let options = TrainOptions { counted_emissions: true, ..Default::default() };
    counted.train(&corpus, &options).unwrap();
    assert!(matches!(counted.states[3].emission, Some(Emission::Counted(_))));
    assert_eq!(direct.labels(&words), counted.labels(&words));
    let a = direct.log_likelihood(&corpus);
    let b = counted.log_likelihood(&corpus);
    assert!((a - b).abs() < 1e-6, "{a} != {b}");
}

#[test]
fn char_ngrams_cover_new_words() {
    init();
    let corpus = companies();
    let mut model = SequenceModel::fully_connected(corpus.labels.clone()).unwrap();
    let options = TrainOptions { unseen_mode: UnseenMode::UseCharNgrams, max_ngram_length: 3, ..Default::default() };
    let report = model.train(&corpus, &options).unwrap();
    assert_eq!(report.ungeneratable, 0);
    let labels = model.labels(&["shares", "of", "Vandelay", "Corp", "fell"]);
    assert_eq!(labels.len(), 5);
    assert_eq!(&labels[..2], &[0, 0]);
}

#[test]
fn held_out_workflow() {
    init();
    let corpus = companies().concat(&companies());
    let mut model = SequenceModel::fully_connected(corpus.labels.clone()).unwrap();
    let options = TrainOptions {
        unseen_mode: UnseenMode::HoldOutMass,
        shrinkage: true,
        held_out_fraction: 0.2,
        ..Default::default()
    };
    let report = model.train(&corpus, &options).unwrap();
    assert!(report.shrinkage_iterations >= 1);
    assert!(report.iterations >= 2);
    assert!(model.check_stochastic().is_empty());
    assert_eq!(model.labels(&["shares", "of", "Hooli", "Corp", "fell"]), vec![0, 0, 1, 1, 0]);
}

#[test]
fn conditional_training() {
    init();
    let corpus = companies();
    let mut model = SequenceModel::fully_connected(corpus.labels.clone()).unwrap();
    let options = TrainOptions { train_type: TrainType::Conditional, lbfgs_max_iterations: 50, ..Default::default() };
    let report = model.train(&corpus, &options).unwrap();
    assert_eq!(report.log_likelihoods.len(), 2);
    assert!(model.check_stochastic().is_empty());
    assert_eq!(model.labels(&["the", "Acme", "Corp", "said"]), vec![0, 1, 1, 0]);
}

#[test]
fn empty_corpus_is_rejected() {
    init();
    let corpus = Corpus::default();
    let mut model = SequenceModel::fully_connected(corpus.labels.clone()).unwrap();
    assert!(matches!(model.train(&corpus, &TrainOptions::default()), Err(HmmError::EmptyCorpus)));
    let options = TrainOptions { held_out_fraction: 2.0, ..Default::default() };
    assert!(matches!(model.train(&companies(), &options), Err(HmmError::InvalidConfiguration(_))));
}
