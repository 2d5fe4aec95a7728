//! Inference engine.
//!
//! This module contains:
//! - Session, the bounded-context state machine
//! - CheckedSession, its sentinel-style error wrapper
//! - Batched evaluation of buffered tokens
//! - Sampler for token selection

pub mod checked;
pub mod evaluator;
pub mod sampler;
pub mod session;

pub use checked::CheckedSession;
pub use evaluator::{evaluate_tokens, Evaluation, Flow};
pub use sampler::{Sampler, SamplingMode};
pub use session::{GenerateHooks, Session, SessionPhase};
