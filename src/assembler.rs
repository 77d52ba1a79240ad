//! Final reassembly: decrypt, verify and write a completed transfer

use crate::crypto::{self, Envelope, EnvelopeError};
use crate::session::Session;
use log::info;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AssembleError {
    #[error("decryption failed: {0}")]
    DecryptionFailed(#[from] EnvelopeError),

    #[error("checksum mismatch: got {actual}, expected {expected}")]
    ChecksumMismatch { actual: String, expected: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Turns a complete session back into the sender's file
#[derive(Debug, Clone)]
pub struct Assembler {
    envelope: Envelope,
    output_dir: PathBuf,
}

impl Assembler {
    pub fn new(envelope: Envelope, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            envelope,
            output_dir: output_dir.into(),
        }
    }

    /// Decrypt the session's ciphertext, check it against `expected_checksum`
    /// and write it under the sanitized filename. Returns the written path.
    ///
    /// Nothing is written unless both decryption and the checksum succeed.
    pub async fn assemble(
        &self,
        session: &Session,
        expected_checksum: &[u8],
    ) -> Result<PathBuf, AssembleError> {
        let ciphertext = session.reassemble().await;

        // KDF + AEAD are CPU-bound; run them off the async workers
        let envelope = self.envelope.clone();
        let salt = session.salt().to_vec();
        let plaintext = tokio::task::spawn_blocking(move || envelope.open(&salt, &ciphertext))
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))??;

        let actual = crypto::checksum(&plaintext);
        if actual.as_slice() != expected_checksum {
            return Err(AssembleError::ChecksumMismatch {
                actual: hex::encode(actual),
                expected: hex::encode(expected_checksum),
            });
        }

        let name = safe_file_name(session.filename())
            .unwrap_or_else(|| format!("received-{}", session.id()));
        let path = self.output_dir.join(name);

        tokio::fs::create_dir_all(&self.output_dir).await?;
        tokio::fs::write(&path, &plaintext).await?;

        info!(
            "[{}] File written: {} ({} bytes)",
            session.id(),
            path.display(),
            plaintext.len()
        );
        Ok(path)
    }
}

/// Final path component of a sender-supplied name, treating both `/` and `\`
/// as separators. `None` when nothing usable is left (`..`, `/`, empty).
pub fn safe_file_name(name: &str) -> Option<String> {
    let last = name.rsplit(&['/', '\\'][..]).next().unwrap_or("");
    match last {
        "" | "." | ".." => None,
        s if s.contains('\0') => None,
        s => Some(s.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{KdfConfig, KdfType};

    fn envelope(passphrase: &str) -> Envelope {
        Envelope::new(
            passphrase,
            KdfConfig {
                kind: KdfType::Pbkdf2,
                pbkdf2_iterations: 1_000,
                ..KdfConfig::default()
            },
        )
    }

    async fn sealed_session(env: &Envelope, filename: &str, plaintext: &[u8]) -> Session {
        let salt = crypto::generate_salt();
        let ciphertext = env.seal(&salt, plaintext).unwrap();
        let chunks: Vec<&[u8]> = ciphertext.chunks(10).collect();

        let session = Session::new("abcd1234", filename, salt.to_vec(), chunks.len() as u32);
        for (i, chunk) in chunks.iter().enumerate() {
            session.store_chunk(i as u32 + 1, chunk.to_vec()).await.unwrap();
        }
        session
    }

    #[test]
    fn test_safe_file_name() {
        assert_eq!(safe_file_name("report.pdf").as_deref(), Some("report.pdf"));
        assert_eq!(safe_file_name("../../etc/passwd").as_deref(), Some("passwd"));
        assert_eq!(safe_file_name("C:\\Users\\x\\notes.txt").as_deref(), Some("notes.txt"));
        assert_eq!(safe_file_name("/abs/path/a.b").as_deref(), Some("a.b"));
        assert_eq!(safe_file_name(".."), None);
        assert_eq!(safe_file_name("dir/"), None);
        assert_eq!(safe_file_name(""), None);
    }

    #[tokio::test]
    async fn test_assemble_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let env = envelope("k");
        let session = sealed_session(&env, "../escape/hello.txt", b"hello world").await;

        let path = Assembler::new(env, dir.path())
            .assemble(&session, &crypto::checksum(b"hello world"))
            .await
            .unwrap();

        assert_eq!(path, dir.path().join("hello.txt"));
        assert_eq!(std::fs::read(&path).unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn test_checksum_mismatch_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let env = envelope("k");
        let session = sealed_session(&env, "hello.txt", b"hello world").await;

        let result = Assembler::new(env, dir.path())
            .assemble(&session, &crypto::checksum(b"something else"))
            .await;

        assert!(matches!(result, Err(AssembleError::ChecksumMismatch { .. })));
        assert!(!dir.path().join("hello.txt").exists());
    }

    #[tokio::test]
    async fn test_wrong_passphrase_is_decryption_failure() {
        let dir = tempfile::tempdir().unwrap();
        let session = sealed_session(&envelope("a"), "hello.txt", b"hello world").await;

        let result = Assembler::new(envelope("b"), dir.path())
            .assemble(&session, &crypto::checksum(b"hello world"))
            .await;

        assert!(matches!(result, Err(AssembleError::DecryptionFailed(_))));
        assert!(!dir.path().join("hello.txt").exists());
    }

    #[tokio::test]
    async fn test_unusable_name_falls_back_to_session_id() {
        let dir = tempfile::tempdir().unwrap();
        let env = envelope("k");
        let session = sealed_session(&env, "..", b"x").await;

        let path = Assembler::new(env, dir.path())
            .assemble(&session, &crypto::checksum(b"x"))
            .await
            .unwrap();
        assert_eq!(path, dir.path().join("received-abcd1234"));
    }
}
