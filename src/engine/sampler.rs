//! Token sampling strategies.
//!
//! This module selects the next token from a logits vector plus the recent
//! token history. It owns no model state, so it can be driven with any
//! logits slice and a [`Vocabulary`] table.
//!
//! ## Sampling Pipeline
//!
//! ```text
//! Logits [vocab_size]
//!     │
//!     ▼ Candidate set (one entry per token id)
//!     │
//!     ▼ Repetition / frequency / presence penalties (last n tokens)
//!     │
//!     ▼ Grammar filter (if a grammar is loaded)
//!     │
//!     ├── temp ≈ 0 or grammar overrides temp ──▶ Greedy (max score)
//!     │
//!     ├── mode 0: top-k → tail-free → typical → top-p → temperature → draw
//!     ├── mode 1: temperature → mirostat (window 100)
//!     └── mode 2: temperature → mirostat v2
//!     │
//!     ▼ Grammar accepts the chosen token
//! Selected token
//! ```
//!
//! Candidate ordering is deterministic: descending score, ties broken by the
//! lower token id.

use std::cmp::Ordering;
use std::collections::HashMap;

use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::trace;

use crate::config::SamplingConfig;
use crate::error::{Error, Result};
use crate::grammar::GrammarConstraint;
use crate::runtime::{Token, Vocabulary};

/// Temperatures closer to zero than this select greedily.
pub const GREEDY_EPSILON: f32 = 0.01;

/// Number of top candidates mirostat v1 uses to estimate the distribution's shape.
pub const MIROSTAT_WINDOW: usize = 100;

/// Sampling policy selected by `SamplingConfig::prefer_mirostat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingMode {
    /// Top-k, tail-free, typical and top-p filtering.
    Nucleus,
    /// Mirostat (v1).
    Mirostat,
    /// Mirostat v2.
    MirostatV2,
}

impl TryFrom<u8> for SamplingMode {
    type Error = Error;

    fn try_from(version: u8) -> Result<Self> {
        match version {
            0 => Ok(Self::Nucleus),
            1 => Ok(Self::Mirostat),
            2 => Ok(Self::MirostatV2),
            other => Err(Error::Sampling(format!("invalid mirostat version {other}"))),
        }
    }
}

/// A token under consideration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    /// Token id.
    pub id: Token,
    /// Current score.
    pub logit: f32,
    /// Probability, valid after the last softmax.
    pub p: f32,
}

/// Working set of candidates.
#[derive(Debug, Clone)]
pub struct Candidates {
    data: Vec<Candidate>,
    sorted: bool,
}

impl Candidates {
    /// One candidate per vocabulary entry, in id order.
    pub fn from_logits(logits: &[f32]) -> Self {
        let data = logits
            .iter()
            .enumerate()
            .map(|(id, &logit)| Candidate {
                id: id as Token,
                logit,
                p: 0.0,
            })
            .collect();
        Self {
            data,
            sorted: false,
        }
    }

    /// Number of candidates left.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether every candidate was filtered out.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Candidates in their current order.
    pub fn as_slice(&self) -> &[Candidate] {
        &self.data
    }

    /// Ids in their current order.
    pub fn ids(&self) -> Vec<Token> {
        self.data.iter().map(|c| c.id).collect()
    }

    /// Look up a candidate by id.
    pub fn get(&self, id: Token) -> Option<&Candidate> {
        self.data.iter().find(|c| c.id == id)
    }

    /// Keep only the candidates matching `keep`.
    pub fn retain(&mut self, keep: impl FnMut(&Candidate) -> bool) {
        self.data.retain(keep);
    }

    fn sort_desc(&mut self) {
        if !self.sorted {
            self.data.sort_by(compare_desc);
            self.sorted = true;
        }
    }

    /// Sort by score and fill in probabilities.
    pub fn softmax(&mut self) {
        if self.data.is_empty() {
            return;
        }
        self.sort_desc();

        let max = self.data[0].logit;
        let mut sum = 0.0f32;
        for c in &mut self.data {
            c.p = (c.logit - max).exp();
            sum += c.p;
        }
        for c in &mut self.data {
            c.p /= sum;
        }
    }

    /// Penalize tokens that occurred in `recent`.
    ///
    /// Positive scores are divided by `repeat`, negative ones multiplied, then
    /// `count * frequency + presence` is subtracted.
    pub fn penalize(&mut self, recent: &[Token], repeat: f32, frequency: f32, presence: f32) {
        if recent.is_empty() || (repeat == 1.0 && frequency == 0.0 && presence == 0.0) {
            return;
        }

        let mut counts: HashMap<Token, usize> = HashMap::new();
        for &token in recent {
            *counts.entry(token).or_insert(0) += 1;
        }

        for c in &mut self.data {
            let Some(&count) = counts.get(&c.id) else {
                continue;
            };
            if c.logit <= 0.0 {
                c.logit *= repeat;
            } else {
                c.logit /= repeat;
            }
            c.logit -= count as f32 * frequency + presence;
        }
        self.sorted = false;
    }

    /// Keep the `k` highest-scoring candidates (0 = all), at least `min_keep`.
    pub fn top_k(&mut self, k: usize, min_keep: usize) {
        let k = if k == 0 { self.data.len() } else { k };
        let k = k.max(min_keep).min(self.data.len());
        self.sort_desc();
        self.data.truncate(k);
    }

    /// Tail-free sampling: cut where the second derivative of the sorted
    /// probabilities flattens out.
    pub fn tail_free(&mut self, z: f32, min_keep: usize) {
        if z >= 1.0 || self.data.len() <= 2 {
            return;
        }
        self.softmax();

        let first: Vec<f32> = self.data.windows(2).map(|w| w[0].p - w[1].p).collect();
        let mut second: Vec<f32> = first.windows(2).map(|w| (w[0] - w[1]).abs()).collect();

        let sum: f32 = second.iter().sum();
        if sum > 1e-6 {
            for d in &mut second {
                *d /= sum;
            }
        } else {
            let uniform = 1.0 / second.len() as f32;
            second.iter_mut().for_each(|d| *d = uniform);
        }

        let mut cumulative = 0.0f32;
        let mut last_idx = self.data.len();
        for (i, d) in second.iter().enumerate() {
            cumulative += d;
            if cumulative > z && i >= min_keep {
                last_idx = i;
                break;
            }
        }
        self.data.truncate(last_idx);
    }

    /// Locally typical sampling: prefer tokens whose surprise is close to the
    /// distribution's entropy.
    pub fn typical(&mut self, p: f32, min_keep: usize) {
        if p >= 1.0 {
            return;
        }
        self.softmax();

        let entropy: f32 = self
            .data
            .iter()
            .filter(|c| c.p > 0.0)
            .map(|c| -c.p * c.p.ln())
            .sum();

        let mut order: Vec<(usize, f32)> = self
            .data
            .iter()
            .enumerate()
            .map(|(i, c)| (i, (-c.p.ln() - entropy).abs()))
            .collect();
        order.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));

        let mut cumulative = 0.0f32;
        let mut last_idx = order.len();
        for (i, &(idx, _)) in order.iter().enumerate() {
            cumulative += self.data[idx].p;
            if cumulative > p && i + 1 >= min_keep {
                last_idx = i + 1;
                break;
            }
        }

        self.data = order[..last_idx].iter().map(|&(idx, _)| self.data[idx]).collect();
        self.sorted = false;
    }

    /// Nucleus filtering: keep the smallest prefix covering probability `p`.
    pub fn top_p(&mut self, p: f32, min_keep: usize) {
        if p >= 1.0 {
            return;
        }
        self.softmax();

        let mut cumulative = 0.0f32;
        let mut last_idx = self.data.len();
        for (i, c) in self.data.iter().enumerate() {
            cumulative += c.p;
            if cumulative >= p && i + 1 >= min_keep {
                last_idx = i + 1;
                break;
            }
        }
        self.data.truncate(last_idx);
    }

    /// Divide every score by `temp`.
    pub fn temperature(&mut self, temp: f32) {
        for c in &mut self.data {
            c.logit /= temp;
        }
        // A negative divisor reverses the order.
        if temp < 0.0 {
            self.sorted = false;
        }
    }

    /// The highest-scoring candidate (lowest id on ties).
    pub fn greedy(&self) -> Option<Token> {
        self.data.iter().min_by(|a, b| compare_desc(a, b)).map(|c| c.id)
    }

    /// Draw a candidate proportionally to its probability.
    pub fn draw(&mut self, rng: &mut StdRng) -> Result<Token> {
        self.softmax();
        let weights: Vec<f64> = self.data.iter().map(|c| f64::from(c.p)).collect();
        let dist = WeightedIndex::new(&weights)
            .map_err(|e| Error::Sampling(format!("failed to create distribution: {e}")))?;
        Ok(self.data[dist.sample(rng)].id)
    }
}

fn compare_desc(a: &Candidate, b: &Candidate) -> Ordering {
    b.logit.total_cmp(&a.logit).then(a.id.cmp(&b.id))
}

/// Token sampler with configurable sampling strategies.
#[derive(Debug, Clone)]
pub struct Sampler {
    /// Sampling policy.
    config: SamplingConfig,
    /// Random number generator.
    rng: StdRng,
    /// Mirostat control variable, `None` until first used.
    mirostat_mu: Option<f32>,
    /// Whether the backend allows mirostat.
    mirostat_available: bool,
}

impl Sampler {
    /// Creates a new sampler seeded from system entropy.
    pub fn new(config: SamplingConfig) -> Self {
        Self::from_rng(config, StdRng::from_entropy())
    }

    /// Creates a new sampler with a specific seed for reproducibility.
    pub fn with_seed(config: SamplingConfig, seed: u64) -> Self {
        Self::from_rng(config, StdRng::seed_from_u64(seed))
    }

    fn from_rng(config: SamplingConfig, rng: StdRng) -> Self {
        Self {
            config,
            rng,
            mirostat_mu: None,
            mirostat_available: true,
        }
    }

    /// Declare whether the backend supports mirostat.
    pub fn with_mirostat_available(mut self, available: bool) -> Self {
        self.mirostat_available = available;
        self
    }

    /// Current sampling configuration.
    pub fn config(&self) -> &SamplingConfig {
        &self.config
    }

    /// Replace the sampling configuration. Resets mirostat if its target changed.
    pub fn set_config(&mut self, config: SamplingConfig) {
        if config.mirostat_target_entropy != self.config.mirostat_target_entropy {
            self.mirostat_mu = None;
        }
        self.config = config;
    }

    /// Current mirostat control variable.
    pub fn mirostat_mu(&self) -> Option<f32> {
        self.mirostat_mu
    }

    /// Restart mirostat at `2 * target_entropy`.
    pub fn reset_mirostat(&mut self) {
        self.mirostat_mu = None;
    }

    /// Select the next token.
    ///
    /// `recent` is the repetition-penalty window (already cut to
    /// `n_repeat_last`). When a grammar is given it filters the candidates
    /// and is advanced with the chosen token.
    pub fn sample<V: Vocabulary + ?Sized>(
        &mut self,
        logits: &[f32],
        recent: &[Token],
        mut grammar: Option<&mut GrammarConstraint>,
        vocab: &V,
    ) -> Result<Token> {
        if logits.is_empty() {
            return Err(Error::Sampling("empty logits".into()));
        }

        let mut candidates = Candidates::from_logits(logits);
        candidates.penalize(
            recent,
            self.config.repeat_penalty,
            self.config.frequency_penalty,
            self.config.presence_penalty,
        );

        if let Some(grammar) = grammar.as_deref() {
            grammar.apply(&mut candidates, vocab)?;
        }

        let overrides_temp = grammar
            .as_deref()
            .is_some_and(GrammarConstraint::overrides_temperature);
        let temp = self.config.temp;

        let token = if overrides_temp || temp.abs() < GREEDY_EPSILON {
            candidates
                .greedy()
                .ok_or_else(|| Error::Sampling("no candidates left".into()))?
        } else {
            match SamplingMode::try_from(self.config.prefer_mirostat)? {
                SamplingMode::Nucleus => self.sample_nucleus(&mut candidates)?,
                SamplingMode::Mirostat => self.sample_mirostat(&mut candidates, logits.len())?,
                SamplingMode::MirostatV2 => self.sample_mirostat_v2(&mut candidates)?,
            }
        };

        if let Some(grammar) = grammar.as_deref_mut() {
            grammar.accept(token, vocab)?;
        }

        trace!(token, "sampled token");
        Ok(token)
    }

    fn sample_nucleus(&mut self, candidates: &mut Candidates) -> Result<Token> {
        candidates.top_k(self.config.top_k as usize, 1);
        candidates.tail_free(self.config.tfs_z, 1);
        candidates.typical(self.config.typical_p, 1);
        candidates.top_p(self.config.top_p, 1);
        candidates.temperature(self.config.temp);
        candidates.draw(&mut self.rng)
    }

    fn check_mirostat(&self) -> Result<()> {
        if self.mirostat_available {
            Ok(())
        } else {
            Err(Error::FeatureUnavailable("mirostat"))
        }
    }

    fn sample_mirostat(&mut self, candidates: &mut Candidates, n_vocab: usize) -> Result<Token> {
        self.check_mirostat()?;
        let tau = self.config.mirostat_target_entropy;
        let eta = self.config.mirostat_learning_rate;
        let mu = self.mirostat_mu.unwrap_or(2.0 * tau);

        candidates.temperature(self.config.temp);
        candidates.softmax();

        // Estimate the Zipf exponent from the most probable tokens.
        let m = MIROSTAT_WINDOW.min(candidates.len());
        let probs = candidates.as_slice();
        let mut sum_ti_bi = 0.0f32;
        let mut sum_ti_sq = 0.0f32;
        for i in 0..m.saturating_sub(1) {
            let t_i = ((i + 2) as f32 / (i + 1) as f32).ln();
            let b_i = (probs[i].p / probs[i + 1].p).ln();
            sum_ti_bi += t_i * b_i;
            sum_ti_sq += t_i * t_i;
        }
        let s_hat = sum_ti_bi / sum_ti_sq;

        let epsilon_hat = s_hat - 1.0;
        let k = ((epsilon_hat * 2f32.powf(mu)) / (1.0 - (n_vocab as f32).powf(-epsilon_hat)))
            .powf(1.0 / s_hat);
        let k = if k.is_finite() && k >= 1.0 {
            k as usize
        } else {
            candidates.len()
        };

        candidates.top_k(k, 1);
        let token = candidates.draw(&mut self.rng)?;
        self.update_mu(candidates, token, mu, tau, eta);
        Ok(token)
    }

    fn sample_mirostat_v2(&mut self, candidates: &mut Candidates) -> Result<Token> {
        self.check_mirostat()?;
        let tau = self.config.mirostat_target_entropy;
        let eta = self.config.mirostat_learning_rate;
        let mu = self.mirostat_mu.unwrap_or(2.0 * tau);

        candidates.temperature(self.config.temp);
        candidates.softmax();

        let keep = candidates
            .as_slice()
            .iter()
            .position(|c| -c.p.log2() > mu)
            .map_or(candidates.len(), |idx| idx.max(1));
        candidates.top_k(keep, 1);

        let token = candidates.draw(&mut self.rng)?;
        self.update_mu(candidates, token, mu, tau, eta);
        Ok(token)
    }

    fn update_mu(&mut self, candidates: &Candidates, token: Token, mu: f32, tau: f32, eta: f32) {
        let p = candidates.get(token).map_or(1.0, |c| c.p);
        let surprise = -p.log2();
        self.mirostat_mu = Some(mu - eta * (surprise - tau));
    }
}
