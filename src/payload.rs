//! Synthetic payload generation.
//!
//! Payload bytes come from a Lehmer (multiplicative linear-congruential)
//! generator:
//! - modulus `2^31 - 1`, multiplier `48271`
//! - the seed starts at `1` for every generation
//! - each output byte is the low 8 bits of the next seed
//!
//! The recurrence must stay bit-for-bit identical so that payloads can be
//! regenerated and compared by any client.

/// Largest payload a single request may ask for (1 GiB).
pub const MAX_PAYLOAD_SIZE: u64 = 1 << 30;

/// Chunk size used when streaming a payload onto the wire.
pub const CHUNK_SIZE: usize = 64 * 1024;

const MODULUS: u64 = 2_147_483_647;
const MULTIPLIER: u64 = 48_271;
const INITIAL_SEED: u64 = 1;

/// Generate `n` deterministic pseudo-random bytes.
pub fn generate(n: usize) -> Vec<u8> {
    let mut out = vec![0u8; n];
    Lehmer::new().fill(&mut out);
    out
}

/// Generator state for one payload.
///
/// Every payload owns its own `Lehmer`; there is no shared seed.
#[derive(Debug, Clone)]
pub struct Lehmer {
    seed: u64,
}

impl Lehmer {
    /// Create a generator positioned at the start of the sequence.
    pub fn new() -> Self {
        Self { seed: INITIAL_SEED }
    }

    /// Produce the next byte of the sequence.
    #[inline]
    pub fn next_byte(&mut self) -> u8 {
        self.seed = self.seed * MULTIPLIER % MODULUS;
        self.seed as u8
    }

    /// Fill `buf` with the next `buf.len()` bytes of the sequence.
    pub fn fill(&mut self, buf: &mut [u8]) {
        for byte in buf.iter_mut() {
            *byte = self.next_byte();
        }
    }
}

impl Default for Lehmer {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator over a payload of known length, yielding chunks of at most
/// [`CHUNK_SIZE`] bytes.
///
/// Concatenating every chunk gives exactly `generate(len)`.
#[derive(Debug)]
pub struct PayloadChunks {
    generator: Lehmer,
    remaining: u64,
    chunk_size: usize,
}

impl PayloadChunks {
    pub fn new(len: u64) -> Self {
        Self::with_chunk_size(len, CHUNK_SIZE)
    }

    pub fn with_chunk_size(len: u64, chunk_size: usize) -> Self {
        Self {
            generator: Lehmer::new(),
            remaining: len,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Bytes not yet yielded.
    pub fn remaining(&self) -> u64 {
        self.remaining
    }
}

impl Iterator for PayloadChunks {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let len = self.remaining.min(self.chunk_size as u64) as usize;
        let mut chunk = vec![0u8; len];
        self.generator.fill(&mut chunk);
        self.remaining -= len as u64;
        Some(chunk)
    }
}

/// Parse a payload size request.
///
/// Returns `None` unless the text is a decimal integer in `1..=MAX_PAYLOAD_SIZE`.
pub fn parse_size(text: &str) -> Option<u64> {
    match text.parse::<i64>() {
        Ok(n) if n > 0 && n as u64 <= MAX_PAYLOAD_SIZE => Some(n as u64),
        _ => None,
    }
}
