use rand::RngCore;
use rand::rngs::OsRng;
use zeroize::Zeroize;

use crate::error::CredentialError;

/// Source of cryptographically secure random bytes.
pub trait EntropySource: Send + Sync {
    fn fill(&self, buf: &mut [u8]) -> Result<(), CredentialError>;
}

/// The operating system RNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsEntropy;

impl EntropySource for OsEntropy {
    fn fill(&self, buf: &mut [u8]) -> Result<(), CredentialError> {
        OsRng
            .try_fill_bytes(buf)
            .map_err(|e| CredentialError::EntropyUnavailable(e.to_string()))
    }
}

pub const HEX_ALPHABET_BITS: f64 = 4.0;

pub const PASSWORD_ALPHABET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_.";

pub const ACCESS_KEY_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Bits of entropy carried by `length` symbols drawn uniformly from `alphabet`.
pub fn entropy_bits(alphabet_len: usize, length: usize) -> f64 {
    (alphabet_len as f64).log2() * length as f64
}

/// Hex encoding of `bytes` fresh random bytes.
pub fn random_hex(source: &dyn EntropySource, bytes: usize) -> Result<String, CredentialError> {
    let mut buf = vec![0u8; bytes];
    let filled = source.fill(&mut buf);
    let encoded = filled.map(|()| hex::encode(&buf));
    buf.zeroize();
    encoded
}

/// `length` symbols drawn uniformly from `alphabet` by rejection sampling.
pub fn random_string(
    source: &dyn EntropySource,
    alphabet: &[u8],
    length: usize,
) -> Result<String, CredentialError> {
    if alphabet.is_empty() || alphabet.len() > 256 {
        return Err(CredentialError::EntropyUnavailable(format!(
            "alphabet of {} symbols cannot be sampled",
            alphabet.len()
        )));
    }
    // Bytes at or above `limit` would bias the modulo and are discarded.
    let limit = 256 - (256 % alphabet.len());
    let mut out = String::with_capacity(length);
    let mut buf = vec![0u8; length.max(16) * 2];

    while out.len() < length {
        if let Err(e) = source.fill(&mut buf) {
            buf.zeroize();
            out.zeroize();
            return Err(e);
        }
        for &b in buf.iter() {
            if out.len() == length {
                break;
            }
            if (b as usize) < limit {
                out.push(alphabet[b as usize % alphabet.len()] as char);
            }
        }
    }
    buf.zeroize();
    Ok(out)
}
