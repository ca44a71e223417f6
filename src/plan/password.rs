//! Admin password generation

use rand::Rng;
use regex::Regex;
use thiserror::Error;

/// Used when generation fails
pub const FALLBACK_PASSWORD: &str = "weakpassword";

/// Letters plus digits without `0`
const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ123456789";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PasswordError {
    #[error("No password met the policy after {0} attempts")]
    Exhausted(u32),

    #[error("Invalid password policy: {0}")]
    Policy(String),
}

pub trait PasswordGenerator: Send + Sync {
    fn generate(&self) -> Result<String, PasswordError>;
}

#[derive(Debug, Clone)]
pub struct RandomPasswordGenerator {
    pub length: usize,
    pub max_attempts: u32,
}

impl Default for RandomPasswordGenerator {
    fn default() -> Self {
        Self {
            length: 16,
            max_attempts: 50,
        }
    }
}

impl RandomPasswordGenerator {
    fn candidate(&self) -> String {
        let mut rng = rand::thread_rng();
        (0..self.length)
            .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
            .collect()
    }
}

impl PasswordGenerator for RandomPasswordGenerator {
    fn generate(&self) -> Result<String, PasswordError> {
        if self.length < 3 {
            return Err(PasswordError::Policy(format!(
                "length {} cannot hold lower, upper and digit",
                self.length
            )));
        }
        let allowed =
            Regex::new("^[a-zA-Z1-9]+$").map_err(|e| PasswordError::Policy(e.to_string()))?;

        for _ in 0..self.max_attempts {
            let candidate = self.candidate();
            if allowed.is_match(&candidate) && meets_policy(&candidate) {
                return Ok(candidate);
            }
        }
        Err(PasswordError::Exhausted(self.max_attempts))
    }
}

/// Mixed-class check: at least one lowercase, one uppercase and one digit
pub fn meets_policy(password: &str) -> bool {
    password.chars().any(|c| c.is_ascii_lowercase())
        && password.chars().any(|c| c.is_ascii_uppercase())
        && password.chars().any(|c| c.is_ascii_digit())
}
