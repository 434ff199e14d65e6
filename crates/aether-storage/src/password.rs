// Credential hashing
//
// Argon2id with explicit cost parameters (19 MiB, 2 passes, 1 lane) so the
// work factor is pinned in code rather than floating with library defaults.
// Hashes are stored in PHC string format, which embeds salt and parameters,
// so the costs can be raised later without invalidating existing accounts.

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};

use aether_core::{KernelError, Result};

const MEMORY_KIB: u32 = 19 * 1024;
const PASSES: u32 = 2;
const LANES: u32 = 1;

fn hasher() -> Result<Argon2<'static>> {
    let params = Params::new(MEMORY_KIB, PASSES, LANES, None)
        .map_err(|e| KernelError::storage(format!("argon2 parameters: {e}")))?;
    Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
}

/// Derive a PHC-format hash of `password` under a fresh random salt
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    hasher()?
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| KernelError::storage(format!("password hashing: {e}")))
}

/// Check `candidate` against a stored PHC hash.
///
/// A mismatch is `Ok(false)`; an undecodable stored hash is an error, since
/// that means the account row is corrupt rather than the password wrong.
pub fn verify_password(candidate: &str, stored: &str) -> Result<bool> {
    let stored = PasswordHash::new(stored)
        .map_err(|e| KernelError::storage(format!("stored password hash is malformed: {e}")))?;
    match hasher()?.verify_password(candidate.as_bytes(), &stored) {
        Ok(()) => Ok(true),
        Err(argon2::password_hash::Error::Password) => Ok(false),
        Err(e) => Err(KernelError::storage(format!("password verification: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_accepts_right_password_only() {
        let hash = hash_password("correct horse battery staple").unwrap();
        assert!(verify_password("correct horse battery staple", &hash).unwrap());
        assert!(!verify_password("wrong", &hash).unwrap());
    }

    #[test]
    fn hash_pins_algorithm_and_costs() {
        let hash = hash_password("x").unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert!(hash.contains("m=19456,t=2,p=1"), "unexpected costs in {hash}");
    }

    #[test]
    fn salts_are_per_hash() {
        let a = hash_password("same").unwrap();
        let b = hash_password("same").unwrap();
        assert_ne!(a, b);
        assert!(verify_password("same", &b).unwrap());
    }

    #[test]
    fn corrupt_stored_hash_is_an_error_not_a_mismatch() {
        assert!(verify_password("x", "not-a-phc-string").is_err());
    }
}
