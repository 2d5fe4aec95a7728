//! Configuration types for lm-session.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default context size used when none is configured.
pub const DEFAULT_CONTEXT_SIZE: u32 = 2024;

/// Session configuration.
///
/// Everything except `sampling` is fixed once a session has been constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionParams {
    /// RNG seed (0 = derive from the clock).
    pub seed: u64,
    /// Threads handed to the runtime (0 = half the available cores).
    pub n_threads: u32,
    /// Context size in tokens.
    pub n_ctx: u32,
    /// Leading tokens that scrolling never evicts. Must be smaller than `n_ctx`.
    pub n_ctx_window_top_bar: u32,
    /// Tokens submitted per decode call.
    pub n_batch: u32,
    /// How many trailing tokens the repetition penalty looks at (0 = disabled).
    pub n_repeat_last: u32,
    /// End-of-sequence events swallowed before generation stops.
    pub n_eos_ignores: u32,
    /// Fraction of the tokens below the top bar kept when scrolling.
    /// 0.0 drops everything after the top bar.
    pub scroll_keep: f32,
    /// Layers offloaded to the GPU by backends that support it.
    pub n_gpu_layers: u32,
    /// Ask the backend to lock weights in memory.
    pub use_mlock: bool,
    /// Sampling policy.
    pub sampling: SamplingConfig,
}

impl Default for SessionParams {
    fn default() -> Self {
        Self {
            seed: 0,
            n_threads: 0,
            n_ctx: DEFAULT_CONTEXT_SIZE,
            n_ctx_window_top_bar: 0,
            n_batch: 8,
            n_repeat_last: 0,
            n_eos_ignores: 0,
            scroll_keep: 0.0,
            n_gpu_layers: 38,
            use_mlock: true,
            sampling: SamplingConfig::default(),
        }
    }
}

impl SessionParams {
    /// Load parameters from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    /// Parse parameters from a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Check the relationships between fields.
    ///
    /// A top bar that fills the whole context would make scrolling unable to
    /// free any room, so it is rejected here instead of surfacing later.
    pub fn validate(&self) -> Result<()> {
        if self.n_ctx == 0 {
            return Err(Error::Config("n_ctx must be greater than zero".into()));
        }
        if self.n_batch == 0 {
            return Err(Error::Config("n_batch must be greater than zero".into()));
        }
        if self.n_ctx_window_top_bar >= self.n_ctx {
            return Err(Error::Config(format!(
                "context window top bar ({}) must be smaller than the context size ({})",
                self.n_ctx_window_top_bar, self.n_ctx
            )));
        }
        if !(0.0..=1.0).contains(&self.scroll_keep) {
            return Err(Error::Config(format!(
                "scroll_keep must be within 0.0..=1.0, got {}",
                self.scroll_keep
            )));
        }
        self.sampling.validate()
    }

    /// Fill in the values that default to "pick something sensible".
    pub fn resolved(mut self) -> Self {
        if self.seed == 0 {
            self.seed = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(1)
                .max(1);
        }
        if self.n_threads == 0 {
            let cores = std::thread::available_parallelism()
                .map(|n| n.get() as u32)
                .unwrap_or(2);
            self.n_threads = (cores / 2).max(1);
        }
        self
    }

    /// Set the RNG seed.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Set the context size.
    pub fn context_size(mut self, n_ctx: u32) -> Self {
        self.n_ctx = n_ctx;
        self
    }

    /// Set the protected top bar.
    pub fn top_bar(mut self, n_tokens: u32) -> Self {
        self.n_ctx_window_top_bar = n_tokens;
        self
    }

    /// Set the fraction kept when scrolling.
    pub fn scroll_keep(mut self, keep: f32) -> Self {
        self.scroll_keep = keep;
        self
    }

    /// Set the decode batch size.
    pub fn batch_size(mut self, n_batch: u32) -> Self {
        self.n_batch = n_batch;
        self
    }

    /// Set the number of swallowed end-of-sequence events.
    pub fn eos_ignores(mut self, n: u32) -> Self {
        self.n_eos_ignores = n;
        self
    }

    /// Set the repetition penalty window.
    pub fn repeat_last(mut self, n: u32) -> Self {
        self.n_repeat_last = n;
        self
    }

    /// Replace the sampling configuration.
    pub fn sampling(mut self, sampling: SamplingConfig) -> Self {
        self.sampling = sampling;
        self
    }
}

/// Sampling configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Top-k sampling (0 = whole vocabulary).
    pub top_k: u32,
    /// Top-p (nucleus) sampling (1.0 = disabled).
    pub top_p: f32,
    /// Tail-free sampling parameter (1.0 = disabled).
    pub tfs_z: f32,
    /// Locally typical sampling parameter (1.0 = disabled).
    pub typical_p: f32,
    /// Temperature. Values within 0.01 of zero select greedily.
    pub temp: f32,
    /// Repetition penalty (1.0 = disabled).
    pub repeat_penalty: f32,
    /// Penalty per prior occurrence inside the repetition window.
    pub frequency_penalty: f32,
    /// Flat penalty for any occurrence inside the repetition window.
    pub presence_penalty: f32,
    /// Mirostat learning rate (eta).
    pub mirostat_learning_rate: f32,
    /// Mirostat target entropy (tau).
    pub mirostat_target_entropy: f32,
    /// 0 = nucleus sampling, 1 = mirostat, 2 = mirostat v2.
    pub prefer_mirostat: u8,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            top_k: 40,
            top_p: 0.9,
            tfs_z: 1.0,
            typical_p: 1.0,
            temp: 0.72,
            repeat_penalty: 1.0,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            mirostat_learning_rate: 0.1,
            mirostat_target_entropy: 5.0,
            prefer_mirostat: 0,
        }
    }
}

impl SamplingConfig {
    /// Greedy configuration: temperature 0.
    pub fn greedy() -> Self {
        Self {
            temp: 0.0,
            ..Default::default()
        }
    }

    /// Reject values that make the filters meaningless.
    ///
    /// The sampling mode is checked when sampling, not here.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("top_p", self.top_p),
            ("tfs_z", self.tfs_z),
            ("typical_p", self.typical_p),
            ("temp", self.temp),
            ("repeat_penalty", self.repeat_penalty),
        ] {
            if !value.is_finite() {
                return Err(Error::Config(format!("{name} must be finite")));
            }
        }
        if self.repeat_penalty <= 0.0 {
            return Err(Error::Config("repeat_penalty must be positive".into()));
        }
        Ok(())
    }

    /// Set the temperature.
    pub fn temperature(mut self, temp: f32) -> Self {
        self.temp = temp;
        self
    }

    /// Set top-k.
    pub fn top_k(mut self, top_k: u32) -> Self {
        self.top_k = top_k;
        self
    }

    /// Set top-p.
    pub fn top_p(mut self, top_p: f32) -> Self {
        self.top_p = top_p;
        self
    }

    /// Set the repetition penalty.
    pub fn repeat_penalty(mut self, penalty: f32) -> Self {
        self.repeat_penalty = penalty;
        self
    }

    /// Select the sampling mode (see `prefer_mirostat`).
    pub fn mirostat(mut self, version: u8) -> Self {
        self.prefer_mirostat = version;
        self
    }
}
