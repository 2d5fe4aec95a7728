//! Scripted model runtime shared by the integration tests.
//!
//! Tokens are bytes (0..=255) plus two specials. Each time the logits are
//! read and a decode follows, the script advances by one, so a run
//! generates the script in order. The runtime rejects decodes that leave a
//! gap or overflow its context, which checks the session's positional
//! bookkeeping from the outside.

#![allow(dead_code)]

use std::cell::Cell;
use std::sync::{Arc, Mutex};

use lm_session::config::{SamplingConfig, SessionParams};
use lm_session::{Capabilities, Error, ModelRuntime, Result, Session, Token, Vocabulary};

pub const EOS: Token = 256;
pub const BOS: Token = 257;
pub const VOCAB_SIZE: usize = 258;

/// Score given to the scripted next token.
pub const SCRIPT_LOGIT: f32 = 10.0;

/// One recorded `decode` call.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodeCall {
    pub n_past: usize,
    pub tokens: Vec<Token>,
}

/// Everything the tests may want to look at after the runtime was boxed.
#[derive(Debug, Default)]
pub struct RuntimeLog {
    pub decodes: Vec<DecodeCall>,
    pub tokenize_bos: Vec<bool>,
}

pub type SharedLog = Arc<Mutex<RuntimeLog>>;

pub struct ScriptedRuntime {
    capacity: usize,
    script: Vec<Token>,
    cursor: usize,
    kv: Vec<Token>,
    logits: Vec<f32>,
    logits_read: Cell<bool>,
    fail_on_decode: Option<usize>,
    decode_count: usize,
    capabilities: Capabilities,
    log: SharedLog,
}

impl ScriptedRuntime {
    pub fn new(capacity: usize) -> Self {
        let mut runtime = Self {
            capacity,
            script: Vec::new(),
            cursor: 0,
            kv: Vec::new(),
            logits: vec![0.0; VOCAB_SIZE],
            logits_read: Cell::new(false),
            fail_on_decode: None,
            decode_count: 0,
            capabilities: Capabilities::default(),
            log: SharedLog::default(),
        };
        runtime.fill_logits();
        runtime
    }

    /// Generate `text` byte by byte, then end-of-sequence forever.
    pub fn with_text(self, text: &str) -> Self {
        self.with_script(text.bytes().map(Token::from).collect())
    }

    pub fn with_script(mut self, script: Vec<Token>) -> Self {
        self.script = script;
        self.fill_logits();
        self
    }

    /// Fail the `n`th decode call (0-based).
    pub fn fail_on_decode(mut self, n: usize) -> Self {
        self.fail_on_decode = Some(n);
        self
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn log(&self) -> SharedLog {
        Arc::clone(&self.log)
    }

    fn next_scripted(&self) -> Token {
        self.script.get(self.cursor).copied().unwrap_or(EOS)
    }

    fn fill_logits(&mut self) {
        self.logits.iter_mut().for_each(|l| *l = 0.0);
        let next = self.next_scripted() as usize;
        self.logits[next] = SCRIPT_LOGIT;
    }
}

impl Vocabulary for ScriptedRuntime {
    fn vocab_size(&self) -> usize {
        VOCAB_SIZE
    }

    fn eos_token(&self) -> Token {
        EOS
    }

    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<Token>> {
        self.log.lock().unwrap().tokenize_bos.push(add_bos);
        let mut tokens = Vec::with_capacity(text.len() + 1);
        if add_bos {
            tokens.push(BOS);
        }
        tokens.extend(text.bytes().map(Token::from));
        Ok(tokens)
    }

    fn token_to_piece(&self, token: Token) -> Result<String> {
        match token {
            0..=255 => Ok(char::from(token as u8).to_string()),
            EOS | BOS => Ok(String::new()),
            other => Err(Error::Tokenization(format!("unknown token {other}"))),
        }
    }
}

impl ModelRuntime for ScriptedRuntime {
    fn context_capacity(&self) -> usize {
        self.capacity
    }

    fn decode(&mut self, tokens: &[Token], n_past: usize) -> Result<()> {
        let call = self.decode_count;
        self.decode_count += 1;
        self.log.lock().unwrap().decodes.push(DecodeCall {
            n_past,
            tokens: tokens.to_vec(),
        });

        if self.fail_on_decode == Some(call) {
            return Err(Error::Decode(format!("injected failure on call {call}")));
        }
        if n_past > self.kv.len() {
            return Err(Error::Decode(format!(
                "gap: n_past {n_past} but only {} tokens evaluated",
                self.kv.len()
            )));
        }
        if n_past + tokens.len() > self.capacity {
            return Err(Error::Decode("context overflow".into()));
        }

        self.kv.truncate(n_past);
        self.kv.extend_from_slice(tokens);

        if self.logits_read.replace(false) {
            self.cursor += 1;
        }
        self.fill_logits();
        Ok(())
    }

    fn logits(&self) -> &[f32] {
        self.logits_read.set(true);
        &self.logits
    }

    fn state_size(&self) -> usize {
        4 + self.kv.len() * 4
    }

    fn copy_state(&self) -> Result<Vec<u8>> {
        let mut blob = Vec::with_capacity(self.state_size());
        blob.extend_from_slice(&(self.cursor as u32).to_le_bytes());
        for token in &self.kv {
            blob.extend_from_slice(&token.to_le_bytes());
        }
        Ok(blob)
    }

    fn set_state(&mut self, state: &[u8]) -> Result<()> {
        if state.len() < 4 || state.len() % 4 != 0 {
            return Err(Error::Deserialize(format!("bad state blob of {} bytes", state.len())));
        }
        let mut words = state
            .chunks_exact(4)
            .map(|c| [c[0], c[1], c[2], c[3]]);
        self.cursor = words.next().map(u32::from_le_bytes).unwrap_or(0) as usize;
        self.kv = words.map(i32::from_le_bytes).collect();
        self.logits_read.set(false);
        self.fill_logits();
        Ok(())
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }
}

/// Greedy parameters sized for `capacity`.
pub fn params(capacity: u32) -> SessionParams {
    SessionParams::default()
        .seed(42)
        .context_size(capacity)
        .sampling(SamplingConfig::greedy())
}

pub fn session(runtime: ScriptedRuntime, params: SessionParams) -> Session {
    Session::new(Box::new(runtime), params).unwrap()
}

/// A session that will generate `text`, plus its runtime log.
pub fn scripted_session(capacity: usize, text: &str) -> (Session, SharedLog) {
    let runtime = ScriptedRuntime::new(capacity).with_text(text);
    let log = runtime.log();
    (session(runtime, params(capacity as u32)), log)
}

pub fn bytes(text: &str) -> Vec<Token> {
    text.bytes().map(Token::from).collect()
}
