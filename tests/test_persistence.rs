use hmmsuite::hmm::UnseenMode;
use hmmsuite::{Corpus, HmmError, SequenceModel, TrainOptions};

const DATA: &str = "\
O\tthe
company\tAcme
company\tCorp
O\tsaid

O\tshares
O\tof
company\tGlobex
company\tInc
O\tfell

O\tthe
company\tGlobex
company\tCorp
O\tsaid
";

fn init() {
    let _ = env_logger::builder().is_test(true).filter_level(log::LevelFilter::Info).try_init();
}

fn trained(options: &TrainOptions) -> SequenceModel {
    let mut corpus = Corpus::default();
    corpus.read(DATA.as_bytes()).expect("failed to read corpus");
    let mut model = SequenceModel::fully_connected(corpus.labels.clone()).unwrap();
    model.train(&corpus, options).expect("failed to train");
    model
}

const PROBES: [&[&str]; 3] = [&["the", "Acme", "Inc", "said"], &["shares", "of", "Zenith", "Corp"], &["fell"]];

#[test]
fn json_file_round_trip() {
    init();
    let model = trained(&TrainOptions { unseen_mode: UnseenMode::UnkLowCounts, ..Default::default() });
    let path = std::env::temp_dir().join(format!("hmmsuite-{}.json", std::process::id()));
    model.save_json(&path).unwrap();
    let back = SequenceModel::load_json(&path).unwrap();
    std::fs::remove_file(&path).unwrap();
    assert_eq!(back.unseen.mode, UnseenMode::UnkLowCounts);
    for words in PROBES {
        assert_eq!(model.best_path(words), back.best_path(words));
    }
}

#[test]
fn bson_round_trip() {
    init();
    let model = trained(&TrainOptions { unseen_mode: UnseenMode::UseCharNgrams, max_ngram_length: 3, ..Default::default() });
    let buf = model.to_bson().unwrap();
    let back = SequenceModel::from_bson(&buf).unwrap();
    assert_eq!(model, back);
    for words in PROBES {
        assert_eq!(model.labels(words), back.labels(words));
    }
}

#[test]
fn shrinkage_model_round_trip() {
    init();
    let model = trained(&TrainOptions { shrinkage: true, held_out_fraction: 0.34, ..Default::default() });
    let back = SequenceModel::from_json(&model.to_json().unwrap()).unwrap();
    for words in PROBES {
        assert_eq!(model.best_path(words), back.best_path(words));
    }
}

#[test]
fn corrupt_input_is_rejected() {
    init();
    assert!(matches!(SequenceModel::from_json("not json"), Err(HmmError::Json(_))));
    assert!(matches!(SequenceModel::from_bson(&[1, 2, 3]), Err(HmmError::BsonDeserialize(_))));
    assert!(matches!(SequenceModel::load_json("/nonexistent/model.json"), Err(HmmError::Io(_))));
}
