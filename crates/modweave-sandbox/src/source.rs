use std::io::Read;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use flate2::read::GzDecoder;

use crate::error::{Error, Result};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const WASM_MAGIC: [u8; 4] = [0x00, 0x61, 0x73, 0x6d];

/// Unpacks a mod payload into module source bytes.
///
/// Accepts gzip, base64 text (optionally wrapping gzip), a raw wasm
/// binary, or WAT text. Corrupt compressed or armored input fails with
/// a decode error.
pub fn decompress(payload: &[u8]) -> Result<Vec<u8>> {
    if payload.starts_with(&GZIP_MAGIC) {
        return gunzip(payload);
    }
    if payload.starts_with(&WASM_MAGIC) {
        return Ok(payload.to_vec());
    }
    if let Ok(text) = std::str::from_utf8(payload) {
        let trimmed = text.trim_start();
        if trimmed.starts_with("(module") || trimmed.starts_with("(component") {
            return Ok(payload.to_vec());
        }
        let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
        let decoded = BASE64
            .decode(compact.as_bytes())
            .map_err(|error| Error::decode(format!("base64: {error}")))?;
        if decoded.starts_with(&GZIP_MAGIC) {
            return gunzip(&decoded);
        }
        return Ok(decoded);
    }
    Err(Error::decode("unrecognized payload"))
}

fn gunzip(payload: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(payload);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|error| Error::decode(format!("gzip: {error}")))?;
    Ok(out)
}
