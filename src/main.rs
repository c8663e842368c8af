use std::{fs::File, path::PathBuf, time::Instant};

use clap::Parser;
use hmmsuite::{Corpus, Result, SequenceModel, TrainOptions};

/// Train a hidden Markov model on labeled sequences (`label<TAB>word` lines,
/// sequences separated by blank lines) and optionally label new data.
#[derive(Debug, Parser)]
#[command(version)]
#[command(propagate_version = true)]
struct Argv {
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    /// write the trained model to this file (BSON when it ends in .bson, JSON otherwise)
    #[arg(short, long, value_name = "MODEL")]
    model: PathBuf,
    /// label the sequences of this file and print `label<TAB>word` lines
    #[arg(short, long, value_name = "FILE")]
    decode: Option<PathBuf>,
    /// print states, transitions and top emissions after training
    #[arg(short, long)]
    report: bool,
    #[command(flatten)]
    options: TrainOptions,
    #[arg(required = true)]
    datasets: Vec<PathBuf>,
}

fn main() -> Result<()> {
    let argv = Argv::parse();
    let level = match argv.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        _ => log::LevelFilter::Debug,
    };
    env_logger::builder().filter_level(level).init();
    log::info!("argv: {:?}", argv);

    let mut corpus = Corpus::default();
    for fpath in &argv.datasets {
        log::info!("reading dataset from: {:?}", fpath);
        corpus.read(File::open(fpath)?)?;
    }
    log::info!("read {} sequences, {} words, {} labels", corpus.len(), corpus.word_count(), corpus.labels.len());

    let begin = Instant::now();
    let mut model = SequenceModel::fully_connected(corpus.labels.clone())?;
    let report = model.train(&corpus, &argv.options)?;
    log::info!(
        "trained in {:?}: {} iterations, converged: {}, final log likelihood: {:?}",
        begin.elapsed(),
        report.iterations,
        report.converged,
        report.log_likelihoods.last()
    );
    if !report.dead_states.is_empty() {
        log::warn!("states never visited: {:?}", report.dead_states);
    }

    if argv.report {
        print!("{}", model.printable_states());
        print!("{}", model.printable_transition_matrix());
        for i in 0..model.num_states() {
            print!("{}", model.printable_emissions(i, 10)?);
        }
    }

    let is_bson = argv.model.extension().map_or(false, |ext| ext == "bson");
    if is_bson {
        model.save_bson(&argv.model)?;
    } else {
        model.save_json(&argv.model)?;
    }
    log::info!("write model to {:?}", argv.model);

    if let Some(fpath) = &argv.decode {
        let mut input = Corpus::new(model.target_names.clone());
        input.read(File::open(fpath)?)?;
        for seq in input.iter() {
            let words: Vec<&str> = seq.words().collect();
            for (label, word) in model.label_names(&words).iter().zip(&words) {
                println!("{label}\t{word}");
            }
            println!();
        }
    }
    Ok(())
}
