//! Model runtime abstraction.
//!
//! A session never touches tensors. Everything it needs from a concrete
//! backend (LLaMA-family, GPT-J-family, MPT-family, ...) goes through the
//! [`ModelRuntime`] capability trait:
//!
//! ```text
//!  text ──tokenize──▶ tokens ──decode(n_past)──▶ logits
//!                                   │
//!                 copy_state / set_state (opaque blob)
//! ```
//!
//! Backends are discovered by [`loader::BackendRegistry`].

pub mod loader;

pub use loader::{Backend, BackendRegistry};

use crate::error::Result;

/// Token id understood by the model runtime.
pub type Token = i32;

/// Optional features a backend may provide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Mirostat sampling can be used with this backend.
    pub mirostat: bool,
    /// Grammar-constrained sampling can be used with this backend.
    pub grammar: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            mirostat: true,
            grammar: true,
        }
    }
}

/// Token-level view of a model's vocabulary.
///
/// Split from [`ModelRuntime`] so sampling and grammar code can be exercised
/// with a plain vocabulary table.
pub trait Vocabulary {
    /// Number of entries in the logits vector.
    fn vocab_size(&self) -> usize;

    /// The end-of-sequence token.
    fn eos_token(&self) -> Token;

    /// Convert text to tokens, optionally prefixed with the beginning-of-sequence token.
    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<Token>>;

    /// Text fragment a token stands for.
    fn token_to_piece(&self, token: Token) -> Result<String>;
}

/// A live model context.
///
/// The context is released when the value is dropped.
pub trait ModelRuntime: Vocabulary + Send {
    /// Context size the runtime was created with.
    fn context_capacity(&self) -> usize;

    /// Evaluate `tokens` at absolute positions `n_past..n_past + tokens.len()`.
    ///
    /// Anything the runtime held at or after `n_past` is discarded. On success
    /// [`logits`](Self::logits) holds the scores for the next token.
    fn decode(&mut self, tokens: &[Token], n_past: usize) -> Result<()>;

    /// Scores for the token following the last decoded position, one per vocabulary entry.
    fn logits(&self) -> &[f32];

    /// Size in bytes of the state blob returned by [`copy_state`](Self::copy_state).
    fn state_size(&self) -> usize;

    /// Byte-exact snapshot of the runtime-internal state.
    fn copy_state(&self) -> Result<Vec<u8>>;

    /// Restore a blob previously produced by [`copy_state`](Self::copy_state).
    fn set_state(&mut self, state: &[u8]) -> Result<()>;

    /// Optional features of this backend.
    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }
}
