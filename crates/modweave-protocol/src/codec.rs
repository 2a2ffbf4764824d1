use thiserror::Error;

/// Decode failures surface here and nowhere else; a bad buffer is logged
/// and dropped by the bus, never answered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("shifted value {0} is not a valid code point")]
    InvalidCodePoint(u32),
    #[error("payload is not valid JSON: {0}")]
    Json(String),
}

/// Symmetric payload obfuscation keyed by a per-session random key plus a
/// build-time pack constant.
///
/// Each character of the cleartext is shifted by the next value of a
/// keyed walk over both keys; decoding runs the same walk and subtracts.
/// This is obfuscation against casual bus snooping, not cryptography.
#[derive(Debug, Clone)]
pub struct PayloadCodec {
    session_key: Vec<u32>,
    pack_key: Vec<u32>,
    seed: u64,
}

impl PayloadCodec {
    pub fn new(session_key: &str, pack_key: &str) -> Self {
        let session_key: Vec<u32> = session_key.chars().map(|c| c as u32).collect();
        let pack_key: Vec<u32> = pack_key.chars().map(|c| c as u32).collect();
        let seed = walk_seed(&session_key, &pack_key);
        Self {
            session_key,
            pack_key,
            seed,
        }
    }

    pub fn encode(&self, message: &str) -> Vec<u32> {
        let mut walk = KeyWalk::new(self);
        message
            .chars()
            .map(|c| (c as u32).wrapping_add(walk.next_shift()))
            .collect()
    }

    pub fn decode(&self, buffer: &[u32]) -> Result<String, DecodeError> {
        let mut walk = KeyWalk::new(self);
        let mut decoded = String::with_capacity(buffer.len());
        for &raw in buffer {
            let code = raw.wrapping_sub(walk.next_shift());
            let c = char::from_u32(code).ok_or(DecodeError::InvalidCodePoint(code))?;
            decoded.push(c);
        }
        Ok(decoded)
    }
}

/// Derives the walk's starting index from both keys: sum the merged code
/// points, folding every second step back down by the merged length.
fn walk_seed(session_key: &[u32], pack_key: &[u32]) -> u64 {
    let merged: Vec<u32> = session_key.iter().chain(pack_key.iter()).copied().collect();
    if merged.is_empty() {
        return 0;
    }
    let half = merged.len() as f64 * 0.5;
    let mut index = 0u64;
    for (i, &code) in merged.iter().enumerate() {
        index = index.wrapping_add(code as u64);
        if i % 2 == 1 {
            index = (index as f64 / half).round() as u64;
        }
    }
    index
}

struct KeyWalk<'a> {
    codec: &'a PayloadCodec,
    index: u64,
}

impl<'a> KeyWalk<'a> {
    fn new(codec: &'a PayloadCodec) -> Self {
        Self {
            codec,
            index: codec.seed,
        }
    }

    fn next_shift(&mut self) -> u32 {
        self.index = self.index.wrapping_add(1);
        let key = if self.index % 2 == 1 {
            &self.codec.session_key
        } else {
            &self.codec.pack_key
        };
        if key.is_empty() {
            return 0;
        }
        key[(self.index % key.len() as u64) as usize]
    }
}
