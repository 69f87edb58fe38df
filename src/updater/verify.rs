//! Integrity gate for downloaded installers.

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

use crate::error::{Error, IntegrityKind, Result};

static SHA256_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[0-9a-fA-F]{64}\b").expect("checksum pattern is valid"));

static SHA256_DIGEST: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^sha256:([0-9a-fA-F]{64})$").expect("digest pattern is valid"));

/// First 64-hex-digit token in a checksum file's text, lowercased.
pub fn parse_checksum_text(text: &str) -> Option<String> {
    SHA256_TOKEN
        .find(text)
        .map(|token| token.as_str().to_ascii_lowercase())
}

/// The hash from an algorithm-tagged `sha256:<hex>` digest field.
pub fn parse_digest(digest: &str) -> Option<String> {
    SHA256_DIGEST
        .captures(digest)
        .and_then(|captures| captures.get(1))
        .map(|token| token.as_str().to_ascii_lowercase())
}

/// What a downloaded installer must match before it may be executed.
#[derive(Debug, Clone)]
pub struct InstallerVerification {
    pub expected_sha256: String,
    /// Declared asset size; 0 disables the size gate.
    pub declared_size: u64,
}

/// Checks size first (no point hashing a truncated file), then streams the
/// file through SHA-256. Any mismatch is fatal.
pub async fn verify_installer(path: &Path, verification: &InstallerVerification) -> Result<()> {
    let metadata = tokio::fs::metadata(path).await?;

    if verification.declared_size > 0 && metadata.len() != verification.declared_size {
        return Err(Error::Integrity {
            path: path.to_path_buf(),
            kind: IntegrityKind::SizeMismatch {
                expected: verification.declared_size,
                actual: metadata.len(),
            },
        });
    }

    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];

    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    let actual = hex::encode(hasher.finalize());
    if !actual.eq_ignore_ascii_case(&verification.expected_sha256) {
        return Err(Error::Integrity {
            path: path.to_path_buf(),
            kind: IntegrityKind::HashMismatch {
                expected: verification.expected_sha256.to_ascii_lowercase(),
                actual,
            },
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAYLOAD: &[u8] = b"installer payload";
    // Well-formed but deliberately NOT the hash of PAYLOAD
    const SAMPLE_SHA256: &str =
        "4a1b8b28b0d6e3b8ba4a8cb5d4f5b5a9e1c7d2f0a3b6c9d2e5f8a1b4c7d0e3f6";

    fn payload_hash() -> String {
        let mut hasher = Sha256::new();
        hasher.update(PAYLOAD);
        hex::encode(hasher.finalize())
    }

    #[test]
    fn checksum_text_yields_the_first_hex_token() {
        let text = format!("{SAMPLE_SHA256}  mediagrab-setup.exe\n");
        assert_eq!(parse_checksum_text(&text).as_deref(), Some(SAMPLE_SHA256));

        let uppercase = SAMPLE_SHA256.to_ascii_uppercase();
        assert_eq!(
            parse_checksum_text(&uppercase).as_deref(),
            Some(SAMPLE_SHA256)
        );
    }

    #[test]
    fn short_or_missing_tokens_are_rejected() {
        assert_eq!(parse_checksum_text("deadbeef  setup.exe"), None);
        assert_eq!(parse_checksum_text("no hashes here"), None);
    }

    #[test]
    fn digest_fields_must_be_sha256_tagged() {
        assert_eq!(
            parse_digest(&format!("sha256:{SAMPLE_SHA256}")).as_deref(),
            Some(SAMPLE_SHA256)
        );
        assert_eq!(parse_digest(&format!("sha512:{SAMPLE_SHA256}")), None);
        assert_eq!(parse_digest(SAMPLE_SHA256), None);
        assert_eq!(parse_digest("sha256:tooshort"), None);
    }

    #[tokio::test]
    async fn matching_size_and_hash_pass_the_gate() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("setup.exe");
        std::fs::write(&path, PAYLOAD).expect("write");

        let verification = InstallerVerification {
            expected_sha256: payload_hash(),
            declared_size: PAYLOAD.len() as u64,
        };
        verify_installer(&path, &verification)
            .await
            .expect("gate passes");
    }

    #[tokio::test]
    async fn expected_hash_comparison_is_case_insensitive() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("setup.exe");
        std::fs::write(&path, PAYLOAD).expect("write");

        let verification = InstallerVerification {
            expected_sha256: payload_hash().to_ascii_uppercase(),
            declared_size: 0,
        };
        verify_installer(&path, &verification)
            .await
            .expect("gate passes");
    }

    #[tokio::test]
    async fn wrong_size_is_rejected_before_hashing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("setup.exe");
        std::fs::write(&path, PAYLOAD).expect("write");

        let verification = InstallerVerification {
            // The hash would match; the size gate must fire first
            expected_sha256: payload_hash(),
            declared_size: PAYLOAD.len() as u64 + 1,
        };
        let err = verify_installer(&path, &verification)
            .await
            .expect_err("size gate fires");

        assert!(matches!(
            err,
            Error::Integrity {
                kind: IntegrityKind::SizeMismatch { .. },
                ..
            }
        ));
    }

    #[tokio::test]
    async fn wrong_hash_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("setup.exe");
        std::fs::write(&path, PAYLOAD).expect("write");

        let verification = InstallerVerification {
            expected_sha256: SAMPLE_SHA256.to_string(),
            declared_size: PAYLOAD.len() as u64,
        };
        let err = verify_installer(&path, &verification)
            .await
            .expect_err("hash gate fires");

        assert!(matches!(
            err,
            Error::Integrity {
                kind: IntegrityKind::HashMismatch { .. },
                ..
            }
        ));
    }
}
