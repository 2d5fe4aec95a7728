//! Sentinel-style wrapper around [`Session`].
//!
//! Each operation reports success as a flag (or an empty string for
//! [`CheckedSession::run`]) and keeps the failure message for
//! [`CheckedSession::last_error`]. Behavior is otherwise identical to the
//! wrapped session, which does all the work.

use std::io::{Read, Write};

use super::session::{GenerateHooks, Session};
use crate::core::Savestate;
use crate::error::{Error, Result};

/// A [`Session`] that records errors instead of returning them.
#[derive(Debug)]
pub struct CheckedSession {
    inner: Session,
    last_error: Option<Error>,
}

impl CheckedSession {
    /// Wrap an existing session.
    pub fn new(inner: Session) -> Self {
        Self {
            inner,
            last_error: None,
        }
    }

    /// Message of the most recent failure, if the last operation failed.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.as_ref().map(ToString::to_string)
    }

    /// The most recent failure itself.
    pub fn last_error_kind(&self) -> Option<&Error> {
        self.last_error.as_ref()
    }

    /// The wrapped session.
    pub fn session(&self) -> &Session {
        &self.inner
    }

    /// Mutable access to the wrapped session.
    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.inner
    }

    /// Unwrap into the plain session.
    pub fn into_inner(self) -> Session {
        self.inner
    }

    fn record<T>(&mut self, result: Result<T>) -> Option<T> {
        match result {
            Ok(value) => {
                self.last_error = None;
                Some(value)
            }
            Err(e) => {
                self.last_error = Some(e);
                None
            }
        }
    }

    /// See [`Session::append`].
    pub fn append(&mut self, text: &str) -> bool {
        let result = self.inner.append(text);
        self.record(result).is_some()
    }

    /// See [`Session::run`]. Returns an empty string on failure.
    pub fn run(&mut self, end: &str, hooks: GenerateHooks<'_>) -> String {
        let result = self.inner.run(end, hooks);
        self.record(result).unwrap_or_default()
    }

    /// See [`Session::create_savestate`].
    pub fn create_savestate(&mut self) -> Option<Savestate> {
        let result = self.inner.create_savestate();
        self.record(result)
    }

    /// See [`Session::restore_savestate`].
    pub fn restore_savestate(&mut self, savestate: &Savestate) -> bool {
        let result = self.inner.restore_savestate(savestate);
        self.record(result).is_some()
    }

    /// See [`Session::serialize`].
    pub fn serialize(&mut self, writer: &mut impl Write) -> bool {
        let result = self.inner.serialize(writer);
        self.record(result).is_some()
    }

    /// See [`Session::deserialize`].
    pub fn deserialize(&mut self, reader: &mut impl Read) -> bool {
        let result = self.inner.deserialize(reader);
        self.record(result).is_some()
    }

    /// See [`Session::load_grammar`].
    pub fn load_grammar(&mut self, src: &str, override_temperature: bool) -> bool {
        let result = self.inner.load_grammar(src, override_temperature);
        self.record(result).is_some()
    }

    /// See [`Session::unload_grammar`].
    pub fn unload_grammar(&mut self) -> bool {
        self.inner.unload_grammar();
        self.last_error = None;
        true
    }
}

impl From<Session> for CheckedSession {
    fn from(inner: Session) -> Self {
        Self::new(inner)
    }
}
