//! lm-session: bounded-context inference sessions for local language models.
//!
//! This crate implements the model-independent half of an inference loop:
//! - A context window that scrolls when it outgrows the model's context
//! - Batched evaluation with progress reporting and cooperative cancellation
//! - A sampling pipeline (penalties, grammar, nucleus, mirostat v1/v2)
//! - Savestates and a portable binary session format
//!
//! Tensor math lives behind the [`runtime::ModelRuntime`] trait.

pub mod config;
pub mod error;

pub mod core;
pub mod engine;
pub mod grammar;
pub mod runtime;

pub use config::{SamplingConfig, SessionParams};
pub use core::{ContextId, ContextWindow, Savestate, SessionImage};
pub use engine::{CheckedSession, Flow, GenerateHooks, Sampler, Session, SessionPhase};
pub use error::{Error, Result};
pub use grammar::{Grammar, GrammarConstraint};
pub use runtime::{Backend, BackendRegistry, Capabilities, ModelRuntime, Token, Vocabulary};
