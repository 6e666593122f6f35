//! Subdomain allocator (C2) — §4.2

use once_label::LABEL_RE;
use rand::Rng;
use thiserror::Error;
use tunnel_common::constants::{SUBDOMAIN_ALLOCATE_RETRIES, SUBDOMAIN_LABEL_LEN};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AllocateError {
    #[error("subdomain allocation exhausted its retry budget")]
    Exhausted,
    #[error("requested subdomain is not a valid DNS label")]
    InvalidLabel,
    #[error("requested subdomain is already registered")]
    AlreadyRegistered,
}

const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

fn random_label() -> String {
    let mut rng = rand::thread_rng();
    (0..SUBDOMAIN_LABEL_LEN)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

/// Validates a client-requested subdomain against the DNS label grammar
/// from §4.2: `^[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?$`.
pub fn is_valid_label(label: &str) -> bool {
    LABEL_RE.is_match(label)
}

/// Allocates a fresh subdomain label, retrying on collision against
/// `is_taken`. Fails with [`AllocateError::Exhausted`] after
/// [`SUBDOMAIN_ALLOCATE_RETRIES`] attempts.
pub fn allocate(is_taken: impl Fn(&str) -> bool) -> Result<String, AllocateError> {
    for _ in 0..SUBDOMAIN_ALLOCATE_RETRIES {
        let label = random_label();
        if !is_taken(&label) {
            return Ok(label);
        }
    }
    Err(AllocateError::Exhausted)
}

/// Validates and reserves a client-requested subdomain. Callers are
/// expected to hold whatever mutual-exclusion guard makes `is_taken`
/// consistent with the subsequent registration (§4.2, §4.4).
pub fn validate_requested(label: &str, is_taken: impl Fn(&str) -> bool) -> Result<(), AllocateError> {
    if !is_valid_label(label) {
        return Err(AllocateError::InvalidLabel);
    }
    if is_taken(label) {
        return Err(AllocateError::AlreadyRegistered);
    }
    Ok(())
}

/// Tiny hand-rolled DNS-label matcher, avoiding a dependency on the `regex`
/// crate for a single fixed pattern: `^[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?$`.
mod once_label {
    pub struct LabelRe;

    impl LabelRe {
        pub fn is_match(&self, s: &str) -> bool {
            if s.is_empty() || s.len() > 63 {
                return false;
            }
            let bytes = s.as_bytes();
            let is_label_char = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
            if !is_label_char(bytes[0]) {
                return false;
            }
            if !is_label_char(bytes[bytes.len() - 1]) {
                return false;
            }
            bytes[1..bytes.len() - 1].iter().all(|&b| is_label_char(b) || b == b'-')
        }
    }

    pub static LABEL_RE: LabelRe = LabelRe;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_label_has_expected_length_and_alphabet() {
        let label = random_label();
        assert_eq!(label.len(), SUBDOMAIN_LABEL_LEN);
        assert!(label.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn allocate_retries_on_collision_then_succeeds() {
        let mut calls = 0;
        let result = allocate(|_| {
            calls += 1;
            calls < 3
        });
        assert!(result.is_ok());
        assert_eq!(calls, 3);
    }

    #[test]
    fn allocate_exhausts_after_budget() {
        let result = allocate(|_| true);
        assert_eq!(result.unwrap_err(), AllocateError::Exhausted);
    }

    #[test]
    fn label_validation_boundaries() {
        assert!(is_valid_label("a"));
        assert!(is_valid_label(&"a".repeat(63)));
        assert!(!is_valid_label(&"a".repeat(64)));
        assert!(is_valid_label("my-app-1"));
        assert!(!is_valid_label("-leading-hyphen"));
        assert!(!is_valid_label("trailing-hyphen-"));
        assert!(!is_valid_label("Has-Upper"));
        assert!(!is_valid_label(""));
    }

    #[test]
    fn validate_requested_rejects_taken_or_invalid() {
        assert_eq!(validate_requested("BAD", |_| false).unwrap_err(), AllocateError::InvalidLabel);
        assert_eq!(validate_requested("ok", |_| true).unwrap_err(), AllocateError::AlreadyRegistered);
        assert!(validate_requested("ok", |_| false).is_ok());
    }
}
