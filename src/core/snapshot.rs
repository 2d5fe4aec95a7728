//! Session persistence.
//!
//! Two forms exist:
//!
//! - [`Savestate`]: an in-memory snapshot that can only be restored into the
//!   session that produced it.
//! - [`SessionImage`]: the portable binary layout used by
//!   `Session::serialize` / `Session::deserialize`.
//!
//! ## Binary layout
//!
//! ```text
//! u32 LE  context capacity     (must match on read)
//! u32 LE  token count
//! u32 LE  prompt byte length
//! u32 LE  runtime state size
//! i32 LE  × token count        token ids
//! u8      × prompt length      prompt text (UTF-8)
//! u8      × state size         runtime state blob
//! ```

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Error, Result};
use crate::runtime::Token;

/// Size in bytes of the fixed header.
pub const HEADER_LEN: usize = 4 * std::mem::size_of::<u32>();

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a live runtime context.
///
/// Each session draws a fresh id at construction; ids are never reused
/// within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(u64);

impl ContextId {
    /// Allocate a new, process-unique id.
    pub fn next() -> Self {
        Self(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw id value.
    pub fn get(&self) -> u64 {
        self.0
    }
}

/// In-memory snapshot of a session.
#[derive(Debug, Clone, PartialEq)]
pub struct Savestate {
    /// Runtime state blob.
    pub(crate) state: Vec<u8>,
    /// Token buffer.
    pub(crate) tokens: Vec<Token>,
    /// Accumulated text.
    pub(crate) prompt: String,
    /// Context the snapshot was taken from.
    pub(crate) context: ContextId,
}

impl Savestate {
    /// Runtime state blob.
    pub fn state(&self) -> &[u8] {
        &self.state
    }

    /// Token buffer at snapshot time.
    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    /// Accumulated text at snapshot time.
    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    /// Context the snapshot belongs to.
    pub fn context(&self) -> ContextId {
        self.context
    }
}

/// Sizes stored at the start of a serialized session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageHeader {
    pub context_capacity: u32,
    pub token_count: u32,
    pub prompt_len: u32,
    pub state_size: u32,
}

impl ImageHeader {
    /// Read the four header fields.
    pub fn read_from(reader: &mut impl Read) -> Result<Self> {
        let mut fields = [0u32; 4];
        for field in &mut fields {
            *field = read_u32(reader).map_err(|e| short_read("data sizes", e))?;
        }
        let [context_capacity, token_count, prompt_len, state_size] = fields;

        Ok(Self {
            context_capacity,
            token_count,
            prompt_len,
            state_size,
        })
    }

    /// Total payload bytes following the header.
    pub fn payload_len(&self) -> u64 {
        u64::from(self.token_count) * std::mem::size_of::<Token>() as u64
            + u64::from(self.prompt_len)
            + u64::from(self.state_size)
    }
}

/// Everything a serialized session contains.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionImage {
    pub context_capacity: usize,
    pub tokens: Vec<Token>,
    pub prompt: String,
    pub state: Vec<u8>,
}

impl SessionImage {
    /// Header describing this image.
    pub fn header(&self) -> Result<ImageHeader> {
        Ok(ImageHeader {
            context_capacity: to_u32(self.context_capacity, "context capacity")?,
            token_count: to_u32(self.tokens.len(), "token count")?,
            prompt_len: to_u32(self.prompt.len(), "prompt length")?,
            state_size: to_u32(self.state.len(), "state size")?,
        })
    }

    /// Write the image in the binary layout.
    pub fn write_to(&self, writer: &mut impl Write) -> Result<()> {
        let header = self.header()?;

        let mut sizes = Vec::with_capacity(HEADER_LEN);
        for size in [
            header.context_capacity,
            header.token_count,
            header.prompt_len,
            header.state_size,
        ] {
            sizes.extend_from_slice(&size.to_le_bytes());
        }
        writer
            .write_all(&sizes)
            .map_err(|e| Error::Serialize(format!("data sizes: {e}")))?;

        let mut token_bytes = Vec::with_capacity(self.tokens.len() * std::mem::size_of::<Token>());
        for token in &self.tokens {
            token_bytes.extend_from_slice(&token.to_le_bytes());
        }
        writer
            .write_all(&token_bytes)
            .map_err(|e| Error::Serialize(format!("tokens: {e}")))?;

        writer
            .write_all(self.prompt.as_bytes())
            .map_err(|e| Error::Serialize(format!("prompt: {e}")))?;

        writer
            .write_all(&self.state)
            .map_err(|e| Error::Serialize(format!("state: {e}")))?;

        Ok(())
    }

    /// Read an image, failing fast if it was written for a different capacity
    /// or the stream ends early.
    pub fn read_from(reader: &mut impl Read, expected_capacity: usize) -> Result<Self> {
        let header = ImageHeader::read_from(reader)?;

        if header.context_capacity as usize != expected_capacity {
            return Err(Error::ContextMismatch {
                expected: expected_capacity,
                found: header.context_capacity as usize,
            });
        }
        if header.token_count as usize > expected_capacity {
            return Err(Error::Deserialize(format!(
                "token count {} exceeds context capacity {expected_capacity}",
                header.token_count
            )));
        }

        let token_bytes = read_exact_vec(
            reader,
            header.token_count as usize * std::mem::size_of::<Token>(),
            "tokens",
        )?;
        let tokens = token_bytes
            .chunks_exact(std::mem::size_of::<Token>())
            .map(|chunk| Token::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();

        let prompt_bytes = read_exact_vec(reader, header.prompt_len as usize, "prompt")?;
        let prompt = String::from_utf8(prompt_bytes)
            .map_err(|e| Error::Deserialize(format!("prompt: {e}")))?;

        let state = read_exact_vec(reader, header.state_size as usize, "state")?;

        Ok(Self {
            context_capacity: expected_capacity,
            tokens,
            prompt,
            state,
        })
    }
}

fn to_u32(value: usize, what: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| Error::Serialize(format!("{what}: {value} does not fit in 32 bits")))
}

fn read_u32(reader: &mut impl Read) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

/// Read exactly `len` bytes without trusting `len` for the up-front allocation.
fn read_exact_vec(reader: &mut impl Read, len: usize, what: &str) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    reader
        .take(len as u64)
        .read_to_end(&mut buf)
        .map_err(|e| short_read(what, e))?;
    if buf.len() != len {
        return Err(Error::Deserialize(format!(
            "{what}: expected {len} bytes, stream ended after {}",
            buf.len()
        )));
    }
    Ok(buf)
}

fn short_read(what: &str, err: io::Error) -> Error {
    Error::Deserialize(format!("{what}: {err}"))
}
