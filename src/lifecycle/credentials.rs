//! Database credential generation and hashing

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::SaltString;
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use rand::distributions::{Alphanumeric, DistString};
use rand::Rng;

use crate::error::ProvisionError;
use crate::models::{Credential, Engine};

const PASSWORD_LEN: usize = 24;
const USERNAME_SUFFIX_LEN: usize = 8;

/// Fresh credential for a new instance
pub fn generate(engine: Engine, host: &str, port: u16) -> Credential {
    let mut rng = rand::rngs::OsRng;

    let username = if engine.supports_custom_username() {
        let suffix: String = (0..USERNAME_SUFFIX_LEN)
            .map(|_| (b'a' + rng.gen_range(0..26)) as char)
            .collect();
        format!("app_{}", suffix)
    } else {
        "default".to_string()
    };

    let database = match engine {
        Engine::Redis => "0".to_string(),
        _ => "main".to_string(),
    };

    Credential {
        username,
        password: Alphanumeric.sample_string(&mut rng, PASSWORD_LEN),
        database,
        host: host.to_string(),
        port,
    }
}

/// Argon2 PHC string for storage
pub fn hash_password(password: &str) -> Result<String, ProvisionError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| ProvisionError::Credential(format!("Failed to hash password: {}", e)))
}

pub fn verify_password(password: &str, hash: &str) -> bool {
    PasswordHash::new(hash)
        .map(|parsed| {
            Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .is_ok()
        })
        .unwrap_or(false)
}
