//! Batched evaluation of buffered tokens.
//!
//! Tokens from `offset` to the end of the buffer are pushed through the
//! runtime in `n_batch`-sized chunks, each tagged with its absolute position.
//! A trailing partial chunk is evaluated one token at a time.
//!
//! ```text
//! tokens:  [ already evaluated | b0 b0 b0 | b1 b1 b1 | r r ]
//!                              ^offset                 ^ singles
//! progress callback after each full batch, then 100% at the end
//! ```
//!
//! A progress callback returning [`Flow::Stop`] ends evaluation early. That
//! is not a failure. A decode error is, and it is returned immediately.

use tracing::debug;

use crate::error::Result;
use crate::runtime::{ModelRuntime, Token};

/// Result of a caller-supplied callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep going.
    Continue,
    /// Stop at the next opportunity. Not an error.
    Stop,
}

impl Flow {
    /// Whether the callback asked to stop.
    pub fn is_stop(self) -> bool {
        self == Flow::Stop
    }
}

impl From<bool> for Flow {
    fn from(keep_going: bool) -> Self {
        if keep_going {
            Flow::Continue
        } else {
            Flow::Stop
        }
    }
}

/// How an evaluation pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Evaluation {
    /// Every token was evaluated.
    Completed,
    /// The progress callback stopped evaluation early.
    Stopped,
}

/// Progress callback receiving percent complete (0.0..=100.0).
pub type ProgressFn<'a> = dyn FnMut(f32) -> Flow + 'a;

/// Evaluate `tokens[offset..]` against `runtime`.
pub fn evaluate_tokens(
    runtime: &mut dyn ModelRuntime,
    tokens: &[Token],
    offset: usize,
    n_batch: usize,
    mut on_progress: Option<&mut ProgressFn<'_>>,
) -> Result<Evaluation> {
    let n_batch = n_batch.max(1);
    let total = tokens.len().saturating_sub(offset);
    debug!(offset, total, n_batch, "evaluating tokens");

    let mut pos = offset;
    while pos + n_batch <= tokens.len() {
        runtime.decode(&tokens[pos..pos + n_batch], pos)?;
        pos += n_batch;

        if let Some(cb) = on_progress.as_deref_mut() {
            let progress = (pos - offset) as f32 / total as f32 * 100.0;
            if cb(progress).is_stop() {
                debug!(pos, "evaluation stopped by callback");
                return Ok(Evaluation::Stopped);
            }
        }
    }

    while pos < tokens.len() {
        runtime.decode(&tokens[pos..pos + 1], pos)?;
        pos += 1;
    }

    if let Some(cb) = on_progress.as_deref_mut() {
        let _ = cb(100.0);
    }

    Ok(Evaluation::Completed)
}
