use rand::rngs::OsRng;
use rand::TryRngCore;

use crate::error::{GatewayError, Result};

const ALPHANUM: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Generate an opaque identifier of `length` characters drawn from
/// `[0-9A-Za-z]` using the operating system CSPRNG.
///
/// Sampling is rejection-based so every character is uniform; a failing
/// RNG surfaces as an error rather than a short or predictable ID.
pub fn random_id(length: usize) -> Result<String> {
    let mut id = String::with_capacity(length);
    let mut buf = [0u8; 64];
    while id.len() < length {
        OsRng
            .try_fill_bytes(&mut buf)
            .map_err(|e| GatewayError::Internal(format!("CSPRNG failure: {e}")))?;
        for byte in buf {
            if id.len() == length {
                break;
            }
            // Reject bytes that would bias the modulus. 248 = 62 * 4.
            if byte < 248 {
                id.push(ALPHANUM[usize::from(byte) % ALPHANUM.len()] as char);
            }
        }
    }
    Ok(id)
}
