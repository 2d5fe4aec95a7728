//! Bounded-context inference session.
//!
//! A [`Session`] owns a model runtime plus the token buffer, accumulated
//! prompt text, sampler and optional grammar that drive it.
//!
//! ## Lifecycle
//!
//! ```text
//!            append()                 run() / append()
//!   Empty ────────────▶ Primed ◀──────────────────────┐
//!                          └──────────────────────────┘
//!
//!   savestate / serialize are valid in either phase
//! ```
//!
//! ## Generation loop
//!
//! ```text
//! sample ─▶ EOS? ──yes──▶ budget left? ──no──▶ done
//!   ▲         │                 │yes
//!   │         │no               ▼
//!   │         └──────────▶ push token (newline for ignored EOS)
//!   │                           │
//!   │                      scroll if over capacity
//!   │                           │
//!   │                      pre_commit(piece) ──Stop──▶ done (token withdrawn)
//!   │                           │
//!   │                      decode token, on_token(piece) ──Stop──▶ done
//!   │                           │
//!   └──── stop marker not yet in output
//! ```

use std::fmt;
use std::io::{Read, Write};

use tracing::{debug, info, warn};

use super::evaluator::{evaluate_tokens, Flow, ProgressFn};
use super::sampler::Sampler;
use crate::config::{SamplingConfig, SessionParams};
use crate::core::{ContextId, ContextWindow, Savestate, SessionImage};
use crate::error::{Error, Result};
use crate::grammar::GrammarConstraint;
use crate::runtime::{ModelRuntime, Token, Vocabulary};

/// Progress callback stored on the session for scroll re-evaluation.
pub type ScrollCallback = Box<dyn FnMut(f32) -> Flow + Send>;

/// Per-token callback used during generation.
pub type TokenHook<'a> = Box<dyn FnMut(&str) -> Flow + 'a>;

/// Phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionPhase {
    /// Constructed, nothing appended yet.
    Empty,
    /// At least one append has completed.
    Primed,
}

impl SessionPhase {
    /// Get the phase name as a static string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Empty => "Empty",
            Self::Primed => "Primed",
        }
    }

    fn for_tokens(tokens: &[Token]) -> Self {
        if tokens.is_empty() {
            Self::Empty
        } else {
            Self::Primed
        }
    }
}

/// Optional callbacks for [`Session::run`].
#[derive(Default)]
pub struct GenerateHooks<'a> {
    on_token: Option<TokenHook<'a>>,
    pre_commit: Option<TokenHook<'a>>,
}

impl<'a> GenerateHooks<'a> {
    /// No callbacks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Called with each piece after it was committed and decoded.
    pub fn on_token(mut self, hook: impl FnMut(&str) -> Flow + 'a) -> Self {
        self.on_token = Some(Box::new(hook));
        self
    }

    /// Called with each piece before it is committed. Returning
    /// [`Flow::Stop`] withdraws the piece and ends generation.
    pub fn pre_commit(mut self, hook: impl FnMut(&str) -> Flow + 'a) -> Self {
        self.pre_commit = Some(Box::new(hook));
        self
    }

    fn call_pre_commit(&mut self, piece: &str) -> Flow {
        self.pre_commit.as_mut().map_or(Flow::Continue, |f| f(piece))
    }

    fn call_on_token(&mut self, piece: &str) -> Flow {
        self.on_token.as_mut().map_or(Flow::Continue, |f| f(piece))
    }
}

/// An inference session bound to one runtime context.
///
/// # Example
///
/// ```ignore
/// let mut session = registry.construct("model.bin", SessionParams::default())?;
/// session.append("Q: What is 2 + 2?\nA:")?;
/// let answer = session.run("\n", GenerateHooks::new())?;
/// ```
pub struct Session {
    /// Identity tag checked by savestate restore.
    id: ContextId,
    /// The live model context.
    runtime: Box<dyn ModelRuntime>,
    /// Effective parameters.
    params: SessionParams,
    /// Token buffer.
    window: ContextWindow,
    /// All text appended or generated so far.
    prompt: String,
    /// Token selection.
    sampler: Sampler,
    /// Active grammar, if any.
    grammar: Option<GrammarConstraint>,
    /// Lifecycle phase.
    phase: SessionPhase,
    /// Progress callback for scroll re-evaluation.
    on_scroll: Option<ScrollCallback>,
}

impl Session {
    /// Wrap a runtime in a new session.
    ///
    /// The runtime's reported context capacity is authoritative; `params.n_ctx`
    /// is only a request made to the backend.
    pub fn new(runtime: Box<dyn ModelRuntime>, params: SessionParams) -> Result<Self> {
        let params = params.resolved();
        params.validate()?;

        let capacity = runtime.context_capacity();
        let window = ContextWindow::from_params(capacity, &params)?;
        let sampler = Sampler::with_seed(params.sampling.clone(), params.seed)
            .with_mirostat_available(runtime.capabilities().mirostat);

        let id = ContextId::next();
        info!(
            context = id.get(),
            capacity,
            top_bar = params.n_ctx_window_top_bar,
            n_batch = params.n_batch,
            "session created"
        );

        Ok(Self {
            id,
            runtime,
            params,
            window,
            prompt: String::new(),
            sampler,
            grammar: None,
            phase: SessionPhase::Empty,
            on_scroll: None,
        })
    }

    /// Identity of the runtime context.
    pub fn id(&self) -> ContextId {
        self.id
    }

    /// Effective parameters.
    pub fn params(&self) -> &SessionParams {
        &self.params
    }

    /// Lifecycle phase.
    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// All text appended or generated so far.
    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    /// The token buffer.
    pub fn tokens(&self) -> &[Token] {
        self.window.tokens()
    }

    /// Current number of tokens in the buffer.
    pub fn context_size(&self) -> usize {
        self.window.len()
    }

    /// Maximum number of tokens the buffer holds.
    pub fn context_capacity(&self) -> usize {
        self.window.capacity()
    }

    /// The sampler, including its mirostat state.
    pub fn sampler(&self) -> &Sampler {
        &self.sampler
    }

    /// Mutable access to the sampler.
    pub fn sampler_mut(&mut self) -> &mut Sampler {
        &mut self.sampler
    }

    /// Replace the sampling configuration.
    pub fn set_sampling(&mut self, config: SamplingConfig) -> Result<()> {
        config.validate()?;
        self.sampler.set_config(config.clone());
        self.params.sampling = config;
        Ok(())
    }

    /// Whether the backend supports mirostat sampling.
    pub fn is_mirostat_available(&self) -> bool {
        self.runtime.capabilities().mirostat
    }

    /// Whether the backend supports grammar-constrained sampling.
    pub fn is_grammar_available(&self) -> bool {
        self.runtime.capabilities().grammar
    }

    /// Progress callback for the re-evaluation that follows a scroll.
    pub fn set_scroll_callback(&mut self, callback: impl FnMut(f32) -> Flow + Send + 'static) {
        self.on_scroll = Some(Box::new(callback));
    }

    /// Remove the scroll callback.
    pub fn clear_scroll_callback(&mut self) {
        self.on_scroll = None;
    }

    /// Tokenize and evaluate `text`.
    pub fn append(&mut self, text: &str) -> Result<()> {
        self.append_inner(text, None)
    }

    /// [`append`](Self::append) with a progress callback for the evaluation.
    pub fn append_with_progress(
        &mut self,
        text: &str,
        mut on_progress: impl FnMut(f32) -> Flow,
    ) -> Result<()> {
        self.append_inner(text, Some(&mut on_progress as &mut ProgressFn<'_>))
    }

    fn append_inner(&mut self, text: &str, on_progress: Option<&mut ProgressFn<'_>>) -> Result<()> {
        if text.is_empty() {
            return Err(Error::InvalidInput("cannot append an empty prompt".into()));
        }

        let add_bos = self.prompt.is_empty();
        let tokens = self.runtime.tokenize(text, add_bos)?;
        debug!(count = tokens.len(), add_bos, "tokenized prompt");

        self.prompt.push_str(text);
        let old_len = self.window.len();
        self.window.extend(&tokens);
        self.phase = SessionPhase::Primed;

        if self.window_scroll()? {
            return Ok(());
        }

        evaluate_tokens(
            self.runtime.as_mut(),
            self.window.tokens(),
            old_len,
            self.params.n_batch as usize,
            on_progress,
        )?;
        Ok(())
    }

    /// Scroll the window if needed and re-evaluate what is left.
    fn window_scroll(&mut self) -> Result<bool> {
        let before = self.window.len();
        if !self.window.scroll() {
            return Ok(false);
        }
        debug!(before, after = self.window.len(), "context window scrolled");

        let on_scroll = self.on_scroll.as_deref_mut().map(|f| f as &mut ProgressFn<'_>);
        evaluate_tokens(
            self.runtime.as_mut(),
            self.window.tokens(),
            0,
            self.params.n_batch as usize,
            on_scroll,
        )?;
        Ok(true)
    }

    fn sample_next(&mut self) -> Result<Token> {
        let recent = self.window.last_n(self.params.n_repeat_last as usize);
        self.sampler.sample(
            self.runtime.logits(),
            recent,
            self.grammar.as_mut(),
            self.runtime.as_ref(),
        )
    }

    fn newline_token(&self) -> Result<Token> {
        self.runtime
            .tokenize("\n", false)?
            .first()
            .copied()
            .ok_or_else(|| Error::Tokenization("newline produced no tokens".into()))
    }

    /// Generate text until `end` appears in the output, the end-of-sequence
    /// budget runs out, or a hook returns [`Flow::Stop`].
    ///
    /// When generation stops at `end`, the returned text is cut just before
    /// it. An empty `end` never matches.
    pub fn run(&mut self, end: &str, mut hooks: GenerateHooks<'_>) -> Result<String> {
        if self.phase == SessionPhase::Empty {
            return Err(Error::InvalidStateTransition {
                from: self.phase.as_str(),
                to: "Generating",
            });
        }

        let eos = self.runtime.eos_token();
        let mut output = String::new();
        let mut eos_count = 0u32;
        let mut aborted = false;

        while end.is_empty() || !output.contains(end) {
            let mut token = self.sample_next()?;

            if token == eos {
                if eos_count == self.params.n_eos_ignores {
                    debug!(eos_count, "end of sequence");
                    aborted = true;
                    break;
                }
                eos_count += 1;
                warn!(eos_count, budget = self.params.n_eos_ignores, "ignoring end of sequence");
                token = self.newline_token()?;
                if let Some(grammar) = self.grammar.as_mut() {
                    let piece = self.runtime.token_to_piece(token)?;
                    if !grammar.allows_text(&piece) {
                        debug!("grammar cannot continue past end of sequence");
                        aborted = true;
                        break;
                    }
                    grammar.accept(token, self.runtime.as_ref())?;
                }
            } else {
                eos_count = 0;
            }

            self.window.push(token);
            let scrolled = self.window_scroll()?;
            // A zero-keep scroll evicts the new token along with the tail.
            let buffered = !scrolled || self.window.len() > self.window.top_bar();
            let piece = self.runtime.token_to_piece(token)?;

            if hooks.call_pre_commit(&piece).is_stop() {
                debug!(buffered, "generation stopped before commit");
                if buffered {
                    self.window.pop();
                }
                aborted = true;
                break;
            }

            self.prompt.push_str(&piece);
            output.push_str(&piece);

            if !scrolled {
                let pos = self.window.len() - 1;
                self.runtime.decode(&[token], pos)?;
            }

            if hooks.call_on_token(&piece).is_stop() {
                debug!("generation stopped by token callback");
                aborted = true;
                break;
            }
        }

        if !aborted && !end.is_empty() {
            if let Some(idx) = output.find(end) {
                output.truncate(idx);
            }
        }
        Ok(output)
    }

    /// Snapshot the runtime state, tokens and prompt.
    pub fn create_savestate(&self) -> Result<Savestate> {
        let savestate = Savestate {
            state: self.runtime.copy_state()?,
            tokens: self.window.tokens().to_vec(),
            prompt: self.prompt.clone(),
            context: self.id,
        };
        debug!(
            context = self.id.get(),
            tokens = savestate.tokens.len(),
            state = savestate.state.len(),
            "savestate created"
        );
        Ok(savestate)
    }

    /// Restore a snapshot taken from this session.
    pub fn restore_savestate(&mut self, savestate: &Savestate) -> Result<()> {
        if savestate.context != self.id {
            return Err(Error::SavestateMismatch);
        }

        self.runtime.set_state(&savestate.state)?;
        self.window.replace(savestate.tokens.clone());
        self.prompt.clone_from(&savestate.prompt);
        self.phase = SessionPhase::for_tokens(&savestate.tokens);
        debug!(context = self.id.get(), tokens = self.window.len(), "savestate restored");
        Ok(())
    }

    /// Write the session in the portable binary layout.
    pub fn serialize(&self, writer: &mut impl Write) -> Result<()> {
        let image = SessionImage {
            context_capacity: self.window.capacity(),
            tokens: self.window.tokens().to_vec(),
            prompt: self.prompt.clone(),
            state: self.runtime.copy_state()?,
        };
        image.write_to(writer)?;
        writer
            .flush()
            .map_err(|e| Error::Serialize(format!("flush: {e}")))?;
        debug!(tokens = image.tokens.len(), state = image.state.len(), "session serialized");
        Ok(())
    }

    /// Replace this session's state with a serialized one.
    ///
    /// The whole stream is read and checked before anything is changed.
    pub fn deserialize(&mut self, reader: &mut impl Read) -> Result<()> {
        let image = SessionImage::read_from(reader, self.window.capacity())?;

        self.runtime.set_state(&image.state)?;
        self.phase = SessionPhase::for_tokens(&image.tokens);
        self.window.replace(image.tokens);
        self.prompt = image.prompt;
        debug!(tokens = self.window.len(), "session deserialized");
        Ok(())
    }

    /// Parse `src` and make it the active grammar.
    ///
    /// With `override_temperature` set, sampling is greedy while the grammar
    /// is active.
    pub fn load_grammar(&mut self, src: &str, override_temperature: bool) -> Result<()> {
        if !self.is_grammar_available() {
            return Err(Error::FeatureUnavailable("grammar"));
        }

        let grammar = GrammarConstraint::parse(src, override_temperature)?;
        info!(
            rules = grammar.grammar().rule_count(),
            override_temperature, "grammar loaded"
        );
        self.grammar = Some(grammar);
        Ok(())
    }

    /// Drop the active grammar, if any.
    pub fn unload_grammar(&mut self) {
        self.grammar = None;
    }

    /// The active grammar.
    pub fn grammar(&self) -> Option<&GrammarConstraint> {
        self.grammar.as_ref()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("phase", &self.phase)
            .field("tokens", &self.window.len())
            .field("capacity", &self.window.capacity())
            .field("prompt_len", &self.prompt.len())
            .field("grammar", &self.grammar.is_some())
            .finish_non_exhaustive()
    }
}
