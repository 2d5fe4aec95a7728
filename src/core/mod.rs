//! Core session state for lm-session.
//!
//! This module contains the pieces a session is made of:
//! - ContextWindow for the bounded token buffer and scrolling
//! - Savestate and the binary session format for persistence

pub mod snapshot;
pub mod window;

pub use snapshot::{ContextId, Savestate, SessionImage};
pub use window::ContextWindow;
