//! Manage tokens: 32 random bytes, hex encoded. Only the SHA-256 digest is
//! kept; the clear token exists once, in the response that issued it.

use rand::Rng;
use sha2::{Digest, Sha256};

use crate::limits::{MANAGE_TOKEN_BYTES, MANAGE_TOKEN_HEX_LEN};
use crate::model::TokenDigest;

use super::EngineError;

/// Fresh token and its digest.
pub fn generate() -> (String, TokenDigest) {
    let mut bytes = [0u8; MANAGE_TOKEN_BYTES];
    rand::rng().fill(&mut bytes);
    let token = hex::encode(bytes);
    let digest = digest(&token);
    (token, digest)
}

pub fn digest(token: &str) -> TokenDigest {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(token.as_bytes()));
    out
}

/// Structural check, then digest. Uppercase hex is accepted and folded.
pub fn parse(presented: &str) -> Result<TokenDigest, EngineError> {
    if presented.len() != MANAGE_TOKEN_HEX_LEN
        || !presented.bytes().all(|b| b.is_ascii_hexdigit())
    {
        return Err(EngineError::TokenInvalid);
    }
    Ok(digest(&presented.to_ascii_lowercase()))
}

/// Compare without an early exit.
pub fn digests_match(a: &TokenDigest, b: &TokenDigest) -> bool {
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
