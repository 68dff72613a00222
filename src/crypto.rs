//! Identifier, token and password helpers shared by the write pipeline.

use anyhow::{anyhow, Result};
use argon2::{Argon2, PasswordHasher, PasswordVerifier};
use password_hash::{PasswordHash, SaltString};

const ALPHANUMERIC: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

fn random_bytes(len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    getrandom::getrandom(&mut buf).map_err(|e| anyhow!(e.to_string()))?;
    Ok(buf)
}

/// Random alphanumeric string of `len` characters.
pub fn random_string(len: usize) -> Result<String> {
    // Rejection sampling keeps the distribution uniform over the 62 symbols
    let limit = 256 - (256 % ALPHANUMERIC.len());
    let mut out = String::with_capacity(len);
    while out.len() < len {
        for b in random_bytes(len * 2)? {
            if (b as usize) < limit {
                out.push(ALPHANUMERIC[b as usize % ALPHANUMERIC.len()] as char);
                if out.len() == len { break; }
            }
        }
    }
    Ok(out)
}

/// New object id: 10 alphanumeric characters.
pub fn new_object_id() -> Result<String> { random_string(10) }

/// Opaque token: 16 random bytes rendered as 32 lowercase hex characters.
pub fn new_token() -> Result<String> {
    let bytes = random_bytes(16)?;
    Ok(bytes.iter().map(|b| format!("{:02x}", b)).collect())
}

pub fn hash_password(password: &str) -> Result<String> {
    let salt_bytes = random_bytes(16)?;
    let salt = SaltString::encode_b64(&salt_bytes).map_err(|e| anyhow!(e.to_string()))?;
    let argon2 = Argon2::default();
    let phc = argon2.hash_password(password.as_bytes(), &salt).map_err(|e| anyhow!(e.to_string()))?.to_string();
    Ok(phc)
}

pub fn verify_password(hash: &str, password: &str) -> bool {
    if let Ok(parsed) = PasswordHash::new(hash) {
        let argon2 = Argon2::default();
        argon2.verify_password(password.as_bytes(), &parsed).is_ok()
    } else { false }
}
