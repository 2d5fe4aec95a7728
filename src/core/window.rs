//! Context window bookkeeping.
//!
//! The window owns the authoritative token buffer of a session and decides
//! what to evict once it outgrows the runtime's context.
//!
//! ## Scrolling
//!
//! ```text
//! before:  [ top bar | older ............ recent ] > capacity
//!                      └──── evicted ───┘└ keep ┘
//! after:   [ top bar | recent ]
//! ```
//!
//! `keep = floor((len - top_bar) * scroll_keep)`, capped so the result fits
//! the capacity. With `scroll_keep == 0.0` only the top bar survives.
//! Eviction shifts positions, so the caller must re-evaluate the whole
//! retained buffer from position 0.

use crate::config::SessionParams;
use crate::error::{Error, Result};
use crate::runtime::Token;

/// Token buffer bounded by a fixed context capacity.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextWindow {
    /// Tokens fed to or produced by the model.
    tokens: Vec<Token>,
    /// Maximum buffer length.
    capacity: usize,
    /// Leading tokens never evicted.
    top_bar: usize,
    /// Fraction of the tail (below the top bar) kept when scrolling.
    scroll_keep: f32,
}

impl ContextWindow {
    /// Create an empty window.
    ///
    /// Fails when the top bar leaves no room for anything else, since
    /// scrolling could then never bring the buffer back under capacity.
    pub fn new(capacity: usize, top_bar: usize, scroll_keep: f32) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::Config("context capacity must be greater than zero".into()));
        }
        if top_bar >= capacity {
            return Err(Error::Config(format!(
                "context window top bar ({top_bar}) must be smaller than the context size ({capacity})"
            )));
        }
        if !(0.0..=1.0).contains(&scroll_keep) {
            return Err(Error::Config(format!(
                "scroll_keep must be within 0.0..=1.0, got {scroll_keep}"
            )));
        }

        Ok(Self {
            tokens: Vec::with_capacity(capacity),
            capacity,
            top_bar,
            scroll_keep,
        })
    }

    /// Create a window from session parameters and the runtime's actual capacity.
    pub fn from_params(capacity: usize, params: &SessionParams) -> Result<Self> {
        Self::new(
            capacity,
            params.n_ctx_window_top_bar as usize,
            params.scroll_keep,
        )
    }

    /// The token buffer.
    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    /// Number of tokens in the buffer.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Maximum buffer length.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Protected prefix length.
    pub fn top_bar(&self) -> usize {
        self.top_bar
    }

    /// Fraction kept when scrolling.
    pub fn scroll_keep(&self) -> f32 {
        self.scroll_keep
    }

    /// The last `n` tokens (fewer if the buffer is shorter).
    pub fn last_n(&self, n: usize) -> &[Token] {
        let start = self.tokens.len().saturating_sub(n);
        &self.tokens[start..]
    }

    /// Append tokens. The buffer may exceed capacity until [`scroll`](Self::scroll) runs.
    pub fn extend(&mut self, tokens: &[Token]) {
        self.tokens.extend_from_slice(tokens);
    }

    /// Append a single token.
    pub fn push(&mut self, token: Token) {
        self.tokens.push(token);
    }

    /// Remove the most recent token.
    pub fn pop(&mut self) -> Option<Token> {
        self.tokens.pop()
    }

    /// Replace the buffer wholesale (savestate restore / deserialization).
    pub fn replace(&mut self, tokens: Vec<Token>) {
        self.tokens = tokens;
    }

    /// True iff the buffer has outgrown the capacity.
    pub fn needs_scroll(&self) -> bool {
        self.tokens.len() > self.capacity
    }

    /// Number of tail tokens a scroll keeps for the current buffer.
    pub fn keep_count(&self) -> usize {
        if self.scroll_keep <= 0.0 {
            return 0;
        }
        let below_bar = self.tokens.len().saturating_sub(self.top_bar);
        let keep = (below_bar as f64 * f64::from(self.scroll_keep)).floor() as usize;
        keep.min(self.capacity - self.top_bar)
    }

    /// Evict tokens if the buffer has outgrown the capacity.
    ///
    /// Returns whether anything was evicted. When it returns true the
    /// runtime's position-indexed state no longer matches the buffer.
    pub fn scroll(&mut self) -> bool {
        if !self.needs_scroll() {
            return false;
        }

        let keep = self.keep_count();
        let tail_start = self.tokens.len() - keep;
        self.tokens.drain(self.top_bar..tail_start);
        true
    }
}
