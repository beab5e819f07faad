use std::fs::File;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub fn sha256_reader_hex(reader: &mut dyn Read) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut buffer = [0_u8; 64 * 1024];
    loop {
        let read = reader
            .read(&mut buffer)
            .context("failed reading data for sha256")?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

pub fn sha256_file_hex(path: &Path) -> Result<String> {
    let mut file = File::open(path)
        .with_context(|| format!("failed to open file for sha256: {}", path.display()))?;
    sha256_reader_hex(&mut file)
        .with_context(|| format!("failed to hash file: {}", path.display()))
}

/// Case-insensitive hex digest comparison that inspects every byte.
pub fn hashes_match(expected: &str, actual: &str) -> bool {
    let expected = expected.trim().as_bytes();
    let actual = actual.trim().as_bytes();
    if expected.len() != actual.len() || expected.is_empty() {
        return false;
    }

    expected
        .iter()
        .zip(actual)
        .fold(0_u8, |diff, (left, right)| {
            diff | (left.to_ascii_lowercase() ^ right.to_ascii_lowercase())
        })
        == 0
}

pub fn verify_sha256_file(path: &Path, expected_hex: &str) -> Result<bool> {
    let actual = sha256_file_hex(path)?;
    Ok(hashes_match(expected_hex, &actual))
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::*;

    const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn sha256_of_known_inputs() {
        assert_eq!(sha256_hex(b"hello"), HELLO_SHA256);
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn hashes_match_ignores_case_and_rejects_empty() {
        assert!(hashes_match(&HELLO_SHA256.to_uppercase(), HELLO_SHA256));
        assert!(!hashes_match("", ""));
        assert!(!hashes_match("abcd", "abc"));
        assert!(!hashes_match("abcd", "abce"));
    }

    #[test]
    fn verify_file_against_expected_digest() {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|value| value.as_nanos())
            .unwrap_or_default();
        let path = std::env::temp_dir().join(format!(
            "updraft-security-{}-{nanos}.bin",
            std::process::id()
        ));
        fs::write(&path, b"hello").expect("must write fixture");

        assert!(verify_sha256_file(&path, HELLO_SHA256).expect("must hash"));
        assert!(!verify_sha256_file(&path, &sha256_hex(b"other")).expect("must hash"));

        let _ = fs::remove_file(&path);
        assert!(verify_sha256_file(&path, HELLO_SHA256).is_err());
    }
}
