use std::collections::HashSet;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::dataset::{Corpus, Sequence};
use crate::error::{HmmError, Result};

use super::config::{
    Source, TrainOptions, TrainType, UnkModel, UnseenMode, LL_CONVERGE_SIZE, MAX_SHRINKAGE_ITERATIONS,
    MONOTONICITY_TOLERANCE, PRUNE_THRESHOLD, TOLERANCE,
};
use super::emission::{
    CharNGramEmission, ConstantEmission, CountedEmission, DirectEmission, Emission, ShrinkageEmission, UnseenEmission,
    WordTable,
};
use super::features::{unknown_token, FeatureBucketEstimator};
use super::lattice::{ForwardOutcome, Lattice};
use super::model::SequenceModel;
use super::state::{BACKGROUND, START};

/// Summary of a training run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainReport {
    /// Completed M-steps (or optimizer iterations for conditional training).
    pub iterations: usize,
    /// False when the iteration ceiling stopped any of the fits.
    pub converged: bool,
    /// Corpus log-likelihood before each M-step and after the last one.
    pub log_likelihoods: Vec<f64>,
    /// Sequences excluded in the last E-step.
    pub ungeneratable: usize,
    pub monotonicity_violations: usize,
    /// States collapsed to a constant emission.
    pub dead_states: Vec<usize>,
    pub shrinkage_iterations: usize,
}

impl TrainReport {
    fn absorb(&mut self, other: TrainReport) {
        self.iterations += other.iterations;
        self.converged &= other.converged;
        self.log_likelihoods.extend(other.log_likelihoods);
        self.ungeneratable = other.ungeneratable;
        self.monotonicity_violations += other.monotonicity_violations;
        for s in other.dead_states {
            if !self.dead_states.contains(&s) {
                self.dead_states.push(s);
            }
        }
        self.shrinkage_iterations += other.shrinkage_iterations;
    }
}

/// Expected sufficient statistics of one E-step.
#[derive(Debug, Clone)]
pub struct Expectations {
    pub num_states: usize,
    /// [i][j] at `num_states * i + j`.
    pub transitions: Vec<f64>,
    pub visits: Vec<f64>,
    /// Expected emissions per state.
    pub words: Vec<WordTable>,
    /// Expected emissions per class, pooled over its states.
    pub class_words: Vec<WordTable>,
    pub class_mass: Vec<f64>,
    /// Singleton-word mass per state and feature bucket.
    pub buckets: Vec<FeatureBucketEstimator>,
    /// Mass on non-singleton words per state.
    pub seen_mass: Vec<f64>,
    pub log_likelihood: f64,
    /// Indexes of sequences the pass could not generate.
    pub ungeneratable: Vec<usize>,
    pub generated: usize,
}

impl Expectations {
    pub fn new(num_states: usize, num_classes: usize, bucket_smoothing: f64) -> Self {
        Self {
            num_states,
            transitions: vec![0.0; num_states * num_states],
            visits: vec![0.0; num_states],
            words: vec![WordTable::new(); num_states],
            class_words: vec![WordTable::new(); num_classes],
            class_mass: vec![0.0; num_classes],
            buckets: vec![FeatureBucketEstimator::new(bucket_smoothing); num_states],
            seen_mass: vec![0.0; num_states],
            log_likelihood: 0.0,
            ungeneratable: Vec::new(),
            generated: 0,
        }
    }

    pub fn transition(&self, i: usize, j: usize) -> f64 {
        self.transitions[self.num_states * i + j]
    }

    /// Adds the statistics of another (disjoint) set of sequences.
    pub fn merge(&mut self, other: Expectations) {
        for (a, b) in self.transitions.iter_mut().zip(&other.transitions) {
            *a += b;
        }
        for (a, b) in self.visits.iter_mut().zip(&other.visits) {
            *a += b;
        }
        for (a, b) in self.words.iter_mut().zip(other.words).chain(self.class_words.iter_mut().zip(other.class_words)) {
            for (w, c) in b {
                *a.entry(w).or_insert(0.0) += c;
            }
        }
        for (a, b) in self.class_mass.iter_mut().zip(&other.class_mass) {
            *a += b;
        }
        for (a, b) in self.buckets.iter_mut().zip(&other.buckets) {
            a.merge(b);
        }
        for (a, b) in self.seen_mass.iter_mut().zip(&other.seen_mass) {
            *a += b;
        }
        self.log_likelihood += other.log_likelihood;
        self.ungeneratable.extend(other.ungeneratable);
        self.generated += other.generated;
    }

    /// Folds the posteriors of one sequence into the totals.
    fn accumulate(&mut self, model: &SequenceModel, lattice: &Lattice, seq: &Sequence, singletons: bool) {
        let states = &model.states;
        let L = self.num_states;
        let T = lattice.num_times;

        for t in 0..T - 1 {
            for i in 0..L {
                if lattice.alpha(t, i) == 0.0 {
                    continue;
                }
                let mut leaving = 0.0;
                for j in 0..L {
                    let x = lattice.xi(t, i, j, states[i].transition[j]);
                    if x != 0.0 {
                        self.transitions[L * i + j] += x;
                        leaving += x;
                    }
                }
                let g = lattice.gamma(t, i);
                if !g.is_finite() || g < 0.0 {
                    log::error!("numerical instability: posterior of state {i} at time {t} is {g}");
                    continue;
                }
                self.visits[i] += g;
                if (leaving - g).abs() > TOLERANCE {
                    log::warn!("state {i} at time {t}: outgoing mass {leaving} differs from posterior {g}");
                }

                if t == 0 || i < BACKGROUND {
                    continue;
                }
                match &states[i].emission {
                    Some(e) if !e.is_constant() => {}
                    _ => continue,
                }
                let word = &seq.tokens[t - 1].word;
                *self.words[i].entry(word.clone()).or_insert(0.0) += g;
                if states[i].kind >= 0 {
                    let c = states[i].kind as usize;
                    if c < self.class_mass.len() {
                        *self.class_words[c].entry(word.clone()).or_insert(0.0) += g;
                        self.class_mass[c] += g;
                    }
                }
                if singletons && model.vocabulary.get(word).copied() == Some(1.0) {
                    self.buckets[i].add(word, g);
                } else {
                    self.seen_mass[i] += g;
                }
            }
        }
    }
}

/// Runs forward/backward over every sequence not in `skip` and collects
/// expected counts.
pub fn expectations(
    model: &SequenceModel,
    corpus: &Corpus,
    scaled: bool,
    restricted: bool,
    skip: &HashSet<usize>,
    bucket_smoothing: f64,
) -> Expectations {
    let L = model.states.len();
    let singletons = model.unseen.mode == UnseenMode::HoldOutMass;
    let mut stats = Expectations::new(L, model.target_names.len(), bucket_smoothing);
    for (d, seq) in corpus.iter().enumerate() {
        if skip.contains(&d) {
            continue;
        }
        let mut lattice = Lattice::new(L, seq.len(), scaled, restricted);
        match lattice.forward(&model.states, &seq.tokens) {
            ForwardOutcome::Ungeneratable { time } => {
                log::warn!(
                    "sequence {d} cannot be generated at time {time} ({} pass); excluded",
                    if restricted { "restricted" } else { "unrestricted" }
                );
                stats.ungeneratable.push(d);
            }
            ForwardOutcome::Generated { log_likelihood } => {
                lattice.backward(&model.states);
                if let Some((t, sum)) = lattice.check_posteriors() {
                    log::warn!("sequence {d}: posteriors at time {t} sum to {sum}");
                }
                stats.log_likelihood += log_likelihood;
                stats.generated += 1;
                stats.accumulate(model, &lattice, seq, singletons);
            }
        }
    }
    stats
}

/// Replaces words seen once over both corpora by unknown-word tokens.
pub fn collapse_rare_words(train: &Corpus, held_out: &Corpus, unk_model: UnkModel) -> (Corpus, Corpus) {
    let mut vocab = train.vocabulary();
    for (w, c) in held_out.vocabulary() {
        *vocab.entry(w).or_insert(0.0) += c;
    }
    let featural = unk_model == UnkModel::FeaturalDecomp;
    let map = |w: &str| {
        if vocab.get(w).copied().unwrap_or(0.0) > 1.0 {
            w.to_string()
        } else {
            unknown_token(w, featural)
        }
    };
    (train.map_words(&map), held_out.map_words(&map))
}

/// Convergence bookkeeping shared by the outer and the nested loop.
pub(crate) struct LikelihoodTracker {
    last: Option<f64>,
    last_gain: f64,
    pub(crate) violations: usize,
}

impl LikelihoodTracker {
    pub(crate) fn new() -> Self {
        Self { last: None, last_gain: f64::INFINITY, violations: 0 }
    }

    /// Records a new log-likelihood and tells whether it has converged: a
    /// relative gain under the threshold that is also no larger than the
    /// previous gain.
    pub(crate) fn update(&mut self, ll: f64, what: &str) -> bool {
        let last = match self.last.replace(ll) {
            Some(last) => last,
            None => return false,
        };
        let gain = ll - last;
        let relative = if last != 0.0 { gain / last.abs() } else { gain };
        if relative < -MONOTONICITY_TOLERANCE {
            log::warn!("{what}: log likelihood went down from {last} to {ll}");
            self.violations += 1;
        }
        let converged = relative < LL_CONVERGE_SIZE && gain <= self.last_gain;
        self.last_gain = gain;
        converged
    }
}

/// Baum-Welch training over a borrowed model.
pub struct TrainingEngine<'m> {
    model: &'m mut SequenceModel,
    options: TrainOptions,
    uniform: DirectEmission,
    /// Class-level distributions, indexed by class id.
    parents: Vec<DirectEmission>,
    ever_visited: Vec<bool>,
    dead: Vec<usize>,
    /// Keep the seen probability of unseen-word models fixed.
    freeze_unseen: bool,
}

impl<'m> TrainingEngine<'m> {
    pub fn new(model: &'m mut SequenceModel, options: TrainOptions) -> Result<Self> {
        options.validate()?;
        model.validate()?;
        let n = model.states.len();
        Ok(Self {
            model,
            options,
            uniform: DirectEmission::default(),
            parents: Vec::new(),
            ever_visited: vec![false; n],
            dead: Vec::new(),
            freeze_unseen: false,
        })
    }

    pub fn model(&self) -> &SequenceModel {
        self.model
    }

    pub(crate) fn model_mut(&mut self) -> &mut SequenceModel {
        self.model
    }

    pub fn options(&self) -> &TrainOptions {
        &self.options
    }

    pub fn parents(&self) -> &[DirectEmission] {
        &self.parents
    }

    pub fn expectations(&self, corpus: &Corpus, scaled: bool, restricted: bool) -> Expectations {
        expectations(self.model, corpus, scaled, restricted, &HashSet::new(), self.options.pseudo_unknowns)
    }

    /// Sets the vocabulary from `corpus` and, when `reset`, gives every
    /// emitting state the corpus unigram distribution in the form the
    /// unseen-word mode asks for. Constant emissions are left alone.
    pub fn init_emissions(&mut self, corpus: &Corpus, reset: bool) {
        let vocab = corpus.vocabulary();
        self.uniform = DirectEmission::uniform(vocab.keys());
        let starter = DirectEmission::from_counts(&vocab);
        let num_classes = self.model.target_names.len();
        if reset || self.parents.len() != num_classes {
            self.parents = vec![starter.clone(); num_classes];
        }
        self.model.vocabulary = vocab;
        self.model.unseen = self.options.unseen_strategy();
        self.sync_shrinkage();
        if !reset {
            return;
        }

        for i in BACKGROUND..self.model.states.len() {
            match &self.model.states[i].emission {
                None => continue,
                Some(e) if e.is_constant() => continue,
                _ => {}
            }
            let emission = match self.options.unseen_mode {
                UnseenMode::HoldOutMass => Emission::Unseen(UnseenEmission::new(starter.clone(), self.options.pseudo_unknowns)),
                UnseenMode::UseCharNgrams => {
                    Emission::CharNGram(CharNGramEmission::new(self.options.max_ngram_length, starter.table()))
                }
                _ if self.options.counted_emissions => Emission::Counted(CountedEmission::new(self.model.vocabulary.clone())),
                _ => Emission::Direct(starter.clone()),
            };
            self.model.states[i].emission = Some(emission);
        }
        log::info!(
            "initialised emissions (vocabulary: {}, tokens: {}, mode: {})",
            self.model.vocabulary.len(),
            corpus.word_count(),
            self.options.unseen_mode
        );
    }

    /// Pushes the current class and uniform distributions into every
    /// shrinkage emission.
    fn sync_shrinkage(&mut self) {
        for state in self.model.states.iter_mut() {
            if let Some(Emission::Shrinkage(s)) = &mut state.emission {
                if state.kind >= 0 {
                    if let Some(parent) = self.parents.get(state.kind as usize) {
                        s.set_parent(parent.clone());
                    }
                }
                s.set_uniform(self.uniform.clone());
            }
        }
    }

    /// M-step. Returns the largest change of any parameter.
    pub fn maximize(&mut self, stats: &Expectations) -> f64 {
        let L = self.model.states.len();
        let pc = self.options.pseudo_transitions;
        let mut max_change: f64 = 0.0;

        /* new rows are computed first and committed together */
        let mut rows = Vec::new();
        for i in 0..L {
            let visits = stats.visits[i];
            if !(visits > 0.0) {
                continue;
            }
            self.mark_visited(i);
            let denom = visits + pc * (L - 1) as f64;
            let row: Vec<f64> = (0..L)
                .map(|j| if j == START { stats.transition(i, j) / denom } else { (stats.transition(i, j) + pc) / denom })
                .collect();
            if let Some(j) = row.iter().position(|p| !p.is_finite() || *p < 0.0) {
                log::error!("numerical instability: transition {i} -> {j} would become {}; row kept", row[j]);
                continue;
            }
            for (new, old) in row.iter().zip(&self.model.states[i].transition) {
                max_change = max_change.max((new - old).abs());
            }
            rows.push((i, row));
        }
        for (i, row) in rows {
            self.model.states[i].transition = row;
        }

        let frozen = self.freeze_unseen || self.options.unseen_prob_source == Source::HeldOut;
        let buckets_from_singletons = self.options.feature_source == Source::Singletons;
        let pseudo_emissions = self.options.pseudo_emissions;
        let hold_out_mass = self.options.unseen_mode == UnseenMode::HoldOutMass;
        for i in BACKGROUND..L {
            if !self.model.states[i].emits_variably() {
                continue;
            }
            if !(stats.visits[i] > 0.0) {
                self.retire_if_unvisited(i);
                continue;
            }
            let emission = match self.model.states[i].emission.as_mut() {
                Some(e) => e,
                None => continue,
            };
            let expected: WordTable = stats.words[i]
                .iter()
                .filter(|(_, &c)| c >= PRUNE_THRESHOLD)
                .map(|(w, c)| (w.clone(), c + pseudo_emissions))
                .collect();
            max_change = max_change.max(emission.adapt(&expected));
            if hold_out_mass {
                if let Some(u) = emission.unseen_mut() {
                    if !frozen {
                        max_change = max_change.max(u.estimate_from_singletons(stats.seen_mass[i], stats.buckets[i].total()));
                    }
                    if buckets_from_singletons {
                        u.set_buckets(stats.buckets[i].clone());
                    }
                }
            }
        }

        self.update_parents(stats);
        max_change
    }

    /// Pads the per-state bookkeeping for states added since the engine
    /// was built.
    pub(crate) fn track_states(&mut self) {
        for _ in self.ever_visited.len()..self.model.states.len() {
            self.ever_visited.push(false);
        }
    }

    pub(crate) fn mark_visited(&mut self, i: usize) {
        self.ever_visited[i] = true;
    }

    /// Collapses the emission of a state not visited during this run to a
    /// constant.
    pub(crate) fn retire_if_unvisited(&mut self, i: usize) {
        if self.ever_visited[i] {
            return;
        }
        log::info!("state {i} was never visited; its emission collapses to a constant");
        self.model.states[i].emission = Some(Emission::Constant(ConstantEmission::ghost()));
        if !self.dead.contains(&i) {
            self.dead.push(i);
        }
    }

    pub fn dead_states(&self) -> &[usize] {
        &self.dead
    }

    /// Re-estimates the class distributions from pooled expected emissions
    /// and hands them to the shrinkage emissions.
    pub(crate) fn update_parents(&mut self, stats: &Expectations) {
        for c in 0..stats.class_mass.len().min(self.parents.len()) {
            let mass = stats.class_mass[c];
            if mass > 0.0 {
                let table = stats.class_words[c].iter().map(|(w, x)| (w.clone(), x / mass)).collect();
                self.parents[c] = DirectEmission::new(table);
            }
        }
        self.sync_shrinkage();
    }

    /// Outer EM loop on label-restricted, scaled passes.
    pub fn baum_welch(&mut self, corpus: &Corpus) -> TrainReport {
        let mut report = TrainReport::default();
        let mut tracker = LikelihoodTracker::new();
        let no_skip = HashSet::new();
        let begin = Instant::now();
        self.track_states();

        loop {
            self.model.check_stochastic();
            let stats = expectations(self.model, corpus, true, true, &no_skip, self.options.pseudo_unknowns);
            report.ungeneratable = stats.ungeneratable.len();
            if stats.generated == 0 {
                log::error!("none of the {} sequences can be generated; training stops", corpus.len());
                break;
            }
            let ll = stats.log_likelihood;
            log::info!("iteration {}: log likelihood {ll:.6} ({} sequences excluded)", report.iterations, report.ungeneratable);
            report.log_likelihoods.push(ll);
            let converged = tracker.update(ll, "EM");
            if converged && report.iterations >= self.options.min_iterations {
                report.converged = true;
                break;
            }
            if report.iterations >= self.options.max_iterations {
                log::warn!("EM stopped after {} iterations without converging", report.iterations);
                break;
            }
            let change = self.maximize(&stats);
            report.iterations += 1;
            log::debug!("iteration {}: largest parameter change {change:.6}", report.iterations);
        }

        report.monotonicity_violations = tracker.violations;
        report.dead_states = self.dead.clone();
        log::info!("EM finished after {} iterations, took {:?}", report.iterations, begin.elapsed());
        report
    }

    /// Wraps every emitting state in a shrinkage mixture with fresh weights.
    fn wrap_shrinkage(&mut self) {
        for i in BACKGROUND..self.model.states.len() {
            let kind = self.model.states[i].kind;
            let emission = match self.model.states[i].emission.take() {
                Some(e) => e,
                None => continue,
            };
            let base = match emission {
                Emission::Constant(_) => {
                    self.model.states[i].emission = Some(emission);
                    continue;
                }
                Emission::Shrinkage(s) => s.into_base(),
                other => other,
            };
            let parent = if kind >= 0 { self.parents.get(kind as usize).cloned() } else { None };
            let parent = parent.unwrap_or_else(|| self.uniform.clone());
            self.model.states[i].emission = Some(Emission::Shrinkage(ShrinkageEmission::new(base, parent, self.uniform.clone())));
        }
    }

    /// Nested EM for shrinkage weights and unseen-word parameters on `docs`.
    ///
    /// When the unseen probability comes from singletons, `docs` is the
    /// training split: words seen once stand in for unseen words and only
    /// their mass drives the shrinkage weights and the buckets. Returns the
    /// number of iterations run.
    pub fn estimate_shrinkage_unseen(&mut self, docs: &Corpus, shrinkage: bool, unseen_probability: bool, buckets: bool) -> usize {
        if shrinkage {
            self.wrap_shrinkage();
        }
        let use_singletons = self.options.unseen_prob_source == Source::Singletons;
        let vocab = self.model.vocabulary.clone();
        let mut tracker = LikelihoodTracker::new();

        let mut iterations = 0;
        while iterations < MAX_SHRINKAGE_ITERATIONS {
            let stats = self.expectations(docs, true, true);
            if stats.generated == 0 {
                log::error!("no held-out sequence can be generated; shrinkage estimation stops");
                break;
            }
            log::info!("shrinkage iteration {iterations}: held-out log likelihood {:.6}", stats.log_likelihood);
            if tracker.update(stats.log_likelihood, "shrinkage") {
                break;
            }
            for i in BACKGROUND..self.model.states.len() {
                let emission = match self.model.states[i].emission.as_mut() {
                    Some(e) if !e.is_constant() => e,
                    _ => continue,
                };
                let singleton_words: WordTable;
                let words = if use_singletons {
                    singleton_words = stats.words[i]
                        .iter()
                        .filter(|(w, _)| vocab.get(*w).copied() == Some(1.0))
                        .map(|(w, c)| (w.clone(), *c))
                        .collect();
                    &singleton_words
                } else {
                    &stats.words[i]
                };
                if let Some(u) = emission.unseen_mut() {
                    if unseen_probability {
                        u.estimate_seen_probability(&stats.words[i], &vocab, use_singletons);
                    }
                    if buckets {
                        u.estimate_buckets(words, &vocab, use_singletons);
                    }
                }
                if let Emission::Shrinkage(s) = emission {
                    if shrinkage {
                        s.estimate_lambda(words);
                    }
                }
            }
            iterations += 1;
        }
        iterations
    }

    fn fit(&mut self, corpus: &Corpus) -> Result<TrainReport> {
        match self.options.train_type {
            TrainType::Joint => Ok(self.baum_welch(corpus)),
            TrainType::Conditional => self.conditional(corpus),
            TrainType::EntropicPriorMap => Ok(self.entropic_map(corpus)),
        }
    }

    /// Full training workflow: optional held-out split and rare-word
    /// collapsing, the main fit, the nested shrinkage/unseen estimation and
    /// a final refit on all data with the estimated parameters kept.
    pub fn train(&mut self, corpus: &Corpus) -> Result<TrainReport> {
        if corpus.is_empty() {
            return Err(HmmError::EmptyCorpus);
        }
        let needs_held_out = self.options.needs_held_out();
        let (train, held_out) = if needs_held_out {
            corpus.split(self.options.held_out_fraction)
        } else {
            (corpus.clone(), Corpus::new(corpus.labels.clone()))
        };
        if train.is_empty() {
            return Err(HmmError::EmptyCorpus);
        }
        let (train, held_out) = if self.options.unseen_mode == UnseenMode::UnkLowCounts {
            collapse_rare_words(&train, &held_out, self.options.unk_model)
        } else {
            (train, held_out)
        };

        self.init_emissions(&train, self.options.init_emissions);
        let mut report = self.fit(&train)?;

        if needs_held_out {
            let hold_out_mass = self.options.unseen_mode == UnseenMode::HoldOutMass;
            let use_singletons = self.options.unseen_prob_source == Source::Singletons;
            let buckets = hold_out_mass && self.options.feature_source == Source::HeldOut;
            let docs = if use_singletons {
                &train
            } else if held_out.is_empty() {
                log::warn!("held-out split is empty; estimating on the training split");
                &train
            } else {
                &held_out
            };
            report.shrinkage_iterations = self.estimate_shrinkage_unseen(docs, self.options.shrinkage, hold_out_mass, buckets);

            if !held_out.is_empty() {
                let all = train.concat(&held_out);
                self.freeze_unseen = true;
                self.init_emissions(&all, false);
                let refit = self.fit(&all);
                self.freeze_unseen = false;
                report.absorb(refit?);
            }
        }
        Ok(report)
    }
}
