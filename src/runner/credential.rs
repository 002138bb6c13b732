//! One-shot, memory-only delivery of the privilege credential.
//!
//! The credential travels from the caller to the child's stdin and nowhere
//! else: never argv, never the environment, never a file. It is consumed by
//! [`deliver`], which writes it once, checks the byte count, closes the
//! writer, and zeroes every copy it made.

use crate::core::UpdaterError;
use secrecy::zeroize::Zeroize;
use secrecy::{ExposeSecret, SecretSlice, SecretString};
use std::fmt;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// A secret the shim uses to validate `sudo`.
///
/// `Debug` never prints the value; the backing memory is zeroed on drop.
pub struct Credential(SecretString);

impl Credential {
    /// Wrap a secret. Trailing newlines are removed; the shim reads one line.
    ///
    /// The value is copied into an exactly-sized allocation and the
    /// caller's `String` is zeroed, spare capacity included.
    pub fn new(secret: impl Into<String>) -> Self {
        let mut secret = secret.into();
        let boxed: Box<str> = secret.trim_end_matches(['\n', '\r']).into();
        secret.zeroize();
        Self(SecretString::from(boxed))
    }

    /// Number of bytes [`deliver`] will write, including the terminating newline.
    #[must_use]
    pub fn wire_len(&self) -> usize {
        self.0.expose_secret().len() + 1
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential([REDACTED])")
    }
}

/// Write `credential` followed by a newline to `writer` in a single write,
/// then close the writer.
///
/// A short write is fatal: the child would otherwise block forever waiting
/// for the rest of a line that never arrives. The caller must kill the child
/// when this returns [`UpdaterError::CredentialWriteError`].
pub async fn deliver<W>(credential: Credential, writer: &mut W) -> Result<usize, UpdaterError>
where
    W: AsyncWrite + Unpin,
{
    let expected = credential.wire_len();
    let payload: SecretSlice<u8> = {
        let mut bytes = Vec::with_capacity(expected);
        bytes.extend_from_slice(credential.0.expose_secret().as_bytes());
        bytes.push(b'\n');
        SecretSlice::from(bytes)
    };
    drop(credential);

    let result = writer.write(payload.expose_secret()).await;
    drop(payload);

    let written = result.map_err(UpdaterError::Io)?;
    if written != expected {
        return Err(UpdaterError::CredentialWriteError {
            expected,
            written,
        });
    }

    writer.shutdown().await.map_err(UpdaterError::Io)?;
    debug!(target: "runner", "Credential delivered ({} bytes), stdin closed", written);
    Ok(written)
}
