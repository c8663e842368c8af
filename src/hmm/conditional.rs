use std::collections::HashSet;
use std::ops::Range;

use crate::dataset::Corpus;
use crate::error::{HmmError, Result};

use super::config::TrainOptions;
use super::model::SequenceModel;
use super::state::{BACKGROUND, FINISH};
use super::trainer::{expectations, TrainReport, TrainingEngine};

/// One free parameter, stored as a log probability.
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    Transition { from: usize, to: usize },
    Emission { state: usize, word: String },
}

/// A transition row or an emission table: parameters that share one
/// probability mass.
#[derive(Debug, Clone)]
struct Block {
    range: Range<usize>,
    /// Log of the uniform probability over the block.
    mean: f64,
    /// Mass the block held before optimization.
    mass: f64,
}

/// Negative conditional log-likelihood log P(labels | words) of a corpus as
/// a function of the model's log parameters, with a Gaussian prior and a
/// quadratic penalty keeping every row and table at its mass.
pub struct ConditionalObjective<'c> {
    corpus: &'c Corpus,
    params: Vec<Param>,
    blocks: Vec<Block>,
    sigma_squared: f64,
    mass_penalty: f64,
    bucket_smoothing: f64,
}

impl<'c> ConditionalObjective<'c> {
    /// Lays out every nonzero transition (the end state's row excluded) and
    /// then, per state with per-word emission parameters, every vocabulary
    /// word with nonzero probability.
    pub fn new(model: &SequenceModel, corpus: &'c Corpus, options: &TrainOptions) -> Self {
        let mut params = Vec::new();
        let mut blocks = Vec::new();
        let mut push_block = |params: &Vec<Param>, begin: usize, mass: f64| {
            let n = params.len() - begin;
            if n > 0 {
                blocks.push(Block { range: begin..params.len(), mean: (1.0 / n as f64).ln(), mass });
            }
        };

        for (i, state) in model.states.iter().enumerate() {
            if i == FINISH {
                continue;
            }
            let begin = params.len();
            let mut mass = 0.0;
            for (j, &p) in state.transition.iter().enumerate() {
                if p > 0.0 {
                    params.push(Param::Transition { from: i, to: j });
                    mass += p;
                }
            }
            push_block(&params, begin, mass);
        }

        for (i, state) in model.states.iter().enumerate() {
            if i < BACKGROUND {
                continue;
            }
            let e = match &state.emission {
                Some(e) if e.is_tunable() => e,
                _ => continue,
            };
            let begin = params.len();
            let mut mass = 0.0;
            for w in model.vocabulary.keys() {
                let p = e.probability(w);
                if p > 0.0 {
                    params.push(Param::Emission { state: i, word: w.clone() });
                    mass += p;
                }
            }
            push_block(&params, begin, mass);
        }

        Self {
            corpus,
            params,
            blocks,
            sigma_squared: options.sigma_squared,
            mass_penalty: options.mass_penalty,
            bucket_smoothing: options.pseudo_unknowns,
        }
    }

    pub fn num_params(&self) -> usize {
        self.params.len()
    }

    pub fn layout(&self) -> &[Param] {
        &self.params
    }

    /// Current log parameters of `model`.
    pub fn params(&self, model: &SequenceModel) -> Vec<f64> {
        self.params
            .iter()
            .map(|p| match p {
                Param::Transition { from, to } => model.states[*from].transition[*to].ln(),
                Param::Emission { state, word } => model.states[*state].emission_probability(word).ln(),
            })
            .collect()
    }

    /// Writes `x` back into `model`.
    pub fn apply_params(&self, model: &mut SequenceModel, x: &[f64]) {
        for (p, v) in self.params.iter().zip(x) {
            match p {
                Param::Transition { from, to } => model.states[*from].transition[*to] = v.exp(),
                Param::Emission { state, word } => {
                    if let Some(e) = model.states[*state].emission.as_mut() {
                        e.set_probability(word, v.exp());
                    }
                }
            }
        }
    }

    /// Objective value at `x`, with its gradient written to `g`. The model
    /// is left holding `x`.
    pub fn evaluate(&self, model: &mut SequenceModel, x: &[f64], g: &mut [f64]) -> f64 {
        self.apply_params(model, x);

        let restricted = expectations(model, self.corpus, true, true, &HashSet::new(), self.bucket_smoothing);
        let skip: HashSet<usize> = restricted.ungeneratable.iter().copied().collect();
        let free = expectations(model, self.corpus, true, false, &skip, self.bucket_smoothing);
        let mut value = -(restricted.log_likelihood - free.log_likelihood);

        for (k, p) in self.params.iter().enumerate() {
            g[k] = match p {
                Param::Transition { from, to } => -(restricted.transition(*from, *to) - free.transition(*from, *to)),
                Param::Emission { state, word } => {
                    let r = restricted.words[*state].get(word).copied().unwrap_or(0.0);
                    let u = free.words[*state].get(word).copied().unwrap_or(0.0);
                    -(r - u)
                }
            };
        }

        for block in &self.blocks {
            let mut mass = 0.0;
            for k in block.range.clone() {
                let d = x[k] - block.mean;
                value += d * d / self.sigma_squared;
                g[k] += 2.0 * d / self.sigma_squared;
                mass += x[k].exp();
            }
            let excess = mass - block.mass;
            value += self.mass_penalty * excess * excess;
            for k in block.range.clone() {
                g[k] += 2.0 * self.mass_penalty * excess * x[k].exp();
            }
        }
        self.check_gradient(g);
        value
    }

    /// Logs every gradient component that is not finite and returns their
    /// indexes.
    pub fn check_gradient(&self, g: &[f64]) -> Vec<usize> {
        let bad: Vec<usize> = g.iter().enumerate().filter(|(_, v)| !v.is_finite()).map(|(k, _)| k).collect();
        for &k in &bad {
            log::warn!("numerical instability: gradient of parameter {k} ({:?}) is {}", self.params[k], g[k]);
        }
        bad
    }
}

/// Rescales every transition row and emission table to sum to one.
fn renormalize(model: &mut SequenceModel) {
    for (i, state) in model.states.iter_mut().enumerate() {
        let sum = state.row_sum();
        if i != FINISH && sum > 0.0 {
            state.transition.iter_mut().for_each(|p| *p /= sum);
        }
        if let Some(e) = state.emission.as_mut() {
            e.normalize();
        }
    }
}

impl<'m> TrainingEngine<'m> {
    /// Maximizes the conditional likelihood of the labels with L-BFGS.
    pub fn conditional(&mut self, corpus: &Corpus) -> Result<TrainReport> {
        let options = self.options().clone();
        let objective = ConditionalObjective::new(self.model(), corpus, &options);
        let mut report = TrainReport::default();
        let before = self.model().log_conditional_likelihood(corpus);
        report.log_likelihoods.push(before);
        if objective.num_params() == 0 {
            log::warn!("no free parameters; conditional training skipped");
            report.converged = true;
            return Ok(report);
        }
        log::info!("conditional training over {} parameters, log conditional likelihood {before:.6}", objective.num_params());

        let x0 = objective.params(self.model());
        let mut x = x0.clone();
        let mut iterations = 0;
        let model = self.model_mut();
        let result = liblbfgs::lbfgs()
            .with_max_iterations(options.lbfgs_max_iterations)
            .with_epsilon(options.lbfgs_epsilon)
            .minimize(
                &mut x,
                |x, gx| {
                    let v = objective.evaluate(model, x, gx);
                    if v.is_finite() {
                        Ok(v)
                    } else {
                        Err(HmmError::Optimizer(format!("objective is not finite: {v}")).into())
                    }
                },
                |p: &liblbfgs::Progress| {
                    log::debug!("L-BFGS iteration {}: f = {:.6}, |x| = {:.6}, |g| = {:.6}", p.niter, p.fx, p.xnorm, p.gnorm);
                    iterations = p.niter;
                    false
                },
            );
        match &result {
            Ok(r) => log::info!("L-BFGS finished after {iterations} iterations, objective {:.6}", r.fx),
            Err(e) => log::error!("L-BFGS stopped after {iterations} iterations: {e}"),
        }

        let mut g = vec![0.0; x.len()];
        if !objective.evaluate(model, &x, &mut g).is_finite() {
            objective.apply_params(model, &x0);
            renormalize(model);
            return Err(HmmError::Optimizer("optimization left the model with a non-finite objective".to_string()));
        }
        renormalize(model);

        let after = model.log_conditional_likelihood(corpus);
        log::info!("log conditional likelihood {before:.6} -> {after:.6}");
        report.iterations = iterations;
        report.converged = result.is_ok();
        report.log_likelihoods.push(after);
        report.ungeneratable =
            expectations(model, corpus, true, true, &HashSet::new(), options.pseudo_unknowns).ungeneratable.len();
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Sequence;
    use crate::hmm::fixtures::{company_model, company_names};
    use crate::hmm::state::START;

    fn corpus() -> Corpus {
        let mut corpus = Corpus::new(company_names());
        corpus.push(Sequence::labeled(&["the", "acme", "corp"], &[0, 1, 1]));
        corpus.push(Sequence::labeled(&["acme", "of", "the"], &[1, 0, 0]));
        corpus.push(Sequence::labeled(&["of", "corp", "the"], &[0, 1, 0]));
        corpus
    }

    #[test]
    fn params_round_trip() {
        let corpus = corpus();
        let mut model = company_model();
        let objective = ConditionalObjective::new(&model, &corpus, &TrainOptions::default());
        // start: 2, two rows of 3 transitions, two tables of 4 words
        assert_eq!(objective.num_params(), 2 + 6 + 8);
        assert_eq!(objective.layout()[0], Param::Transition { from: START, to: 2 });
        let x = objective.params(&model);
        let snapshot = model.clone();
        objective.apply_params(&mut model, &x);
        for (a, b) in model.states.iter().zip(&snapshot.states) {
            for (p, q) in a.transition.iter().zip(&b.transition) {
                assert!((p - q).abs() < 1e-12);
            }
            for w in ["the", "of", "acme", "corp"] {
                assert!((a.emission_probability(w) - b.emission_probability(w)).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn gradient_matches_finite_differences() {
        let corpus = corpus();
        let mut model = company_model();
        let objective = ConditionalObjective::new(&model, &corpus, &TrainOptions { sigma_squared: 10.0, ..Default::default() });
        let x = objective.params(&model);
        let mut g = vec![0.0; x.len()];
        let f = objective.evaluate(&mut model, &x, &mut g);
        assert!((f - (-model.log_conditional_likelihood(&corpus)) - prior(&objective, &x)).abs() < 1e-9);

        let h = 1e-5;
        let mut scratch = vec![0.0; x.len()];
        for k in 0..x.len() {
            let mut xp = x.clone();
            xp[k] += h;
            let fp = objective.evaluate(&mut model, &xp, &mut scratch);
            let mut xm = x.clone();
            xm[k] -= h;
            let fm = objective.evaluate(&mut model, &xm, &mut scratch);
            let numeric = (fp - fm) / (2.0 * h);
            assert!(
                (numeric - g[k]).abs() < 1e-4 * g[k].abs().max(1.0),
                "{:?}: analytic {} numeric {}",
                objective.layout()[k],
                g[k],
                numeric
            );
        }
    }

    #[test]
    fn non_finite_gradient_is_flagged() {
        let corpus = corpus();
        let mut model = company_model();
        let objective = ConditionalObjective::new(&model, &corpus, &TrainOptions::default());
        let x = objective.params(&model);
        let mut g = vec![0.0; x.len()];
        objective.evaluate(&mut model, &x, &mut g);
        assert!(objective.check_gradient(&g).is_empty());
        g[3] = f64::NAN;
        g[5] = f64::INFINITY;
        assert_eq!(objective.check_gradient(&g), vec![3, 5]);
    }

    /// Prior and mass terms at `x`; masses are untouched at the start.
    fn prior(objective: &ConditionalObjective, x: &[f64]) -> f64 {
        objective
            .blocks
            .iter()
            .flat_map(|b| b.range.clone().map(move |k| (k, b.mean)))
            .map(|(k, mean)| (x[k] - mean).powi(2) / objective.sigma_squared)
            .sum()
    }

    #[test]
    fn lbfgs_improves_conditional_likelihood() {
        let corpus = corpus();
        let mut model = company_model();
        let before = model.log_conditional_likelihood(&corpus);
        let options = TrainOptions { lbfgs_max_iterations: 30, mass_penalty: 100.0, ..Default::default() };
        let mut engine = TrainingEngine::new(&mut model, options).unwrap();
        let report = engine.conditional(&corpus).unwrap();
        assert_eq!(report.log_likelihoods.len(), 2);
        assert_eq!(report.log_likelihoods[0], before);
        assert!(model.check_stochastic().is_empty());
        assert!(model.check_normalized().is_empty());
        let after = model.log_conditional_likelihood(&corpus);
        assert!(after > before, "{before} -> {after}");
    }

    #[test]
    fn conditional_training_end_to_end() {
        let corpus = corpus();
        let mut model = SequenceModel::fully_connected(company_names()).unwrap();
        let options = TrainOptions { train_type: crate::hmm::config::TrainType::Conditional, ..Default::default() };
        let report = model.train(&corpus, &options).unwrap();
        assert_eq!(report.ungeneratable, 0);
        assert!(model.check_stochastic().is_empty());
        assert_eq!(model.labels(&["the", "acme", "corp"]).len(), 3);
    }
}
