//! Chunked AEAD envelope format: header parsing/writing and streaming encrypt/decrypt.
//!
//! Each file is encrypted under its own fresh DEK. The header commits to the plaintext
//! length and the base nonce; every chunk's AAD commits to that length and its own index,
//! so truncation, reordering, and chunk substitution all fail authentication.

mod header;

use std::path::Path;

use aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{instrument, trace};

use crate::secure_buffer::SecureBuffer;
pub use header::{HeaderError, CHUNK_SIZE_MAX, CHUNK_SIZE_MIN, DEFAULT_CHUNK_SIZE, MAGIC};
use header::{EnvelopeHeader, NONCE_LEN};

const TAG_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error(transparent)]
    Header(#[from] HeaderError),
    #[error("I/O error during {operation}: {source}")]
    Io {
        operation: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("AEAD authentication failed on chunk {chunk_index}")]
    AuthenticationFailed { chunk_index: u64 },
    #[error("chunk {chunk_index} declares ciphertext length {declared}, exceeding the maximum of {max}")]
    ChunkTooLarge { chunk_index: u64, declared: u64, max: u64 },
    #[error("cumulative plaintext length {actual} exceeds the authenticated total {expected}")]
    LengthExceeded { actual: u64, expected: u64 },
    #[error("cumulative plaintext length {actual} does not match the authenticated total {expected}")]
    LengthMismatch { actual: u64, expected: u64 },
    #[error("file contains more than 2^32 chunks")]
    TooManyChunks,
    #[error("failed to secure key material: {0}")]
    SecureBuffer(#[from] crate::secure_buffer::SecureBufferError),
    #[error("DEK was not a valid AES-256 key")]
    InvalidKey,
}

fn cipher_from_dek(dek: &SecureBuffer) -> Result<Aes256Gcm, EnvelopeError> {
    dek.with_bytes(|bytes| Aes256Gcm::new_from_slice(bytes))?.map_err(|_| EnvelopeError::InvalidKey)
}

/// Emitted at 20% milestones of total size processed. Advisory only.
#[derive(Debug, Clone, Copy)]
pub struct ProgressEvent {
    pub bytes_done: u64,
    pub bytes_total: u64,
}

/// Options controlling a single encrypt or decrypt call.
pub struct EnvelopeOptions {
    pub chunk_size: u32,
    pub fsync: bool,
    pub progress: Option<tokio::sync::mpsc::UnboundedSender<ProgressEvent>>,
}

impl Default for EnvelopeOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            fsync: true,
            progress: None,
        }
    }
}

fn nonce_for_chunk(base_nonce: &[u8; NONCE_LEN], index: u64) -> [u8; NONCE_LEN] {
    let counter = index.to_be_bytes();
    let mut out = *base_nonce;
    // XOR the counter into the low 8 bytes of the 12-byte nonce.
    for (byte, counter_byte) in out[NONCE_LEN - 8..].iter_mut().zip(counter.iter()) {
        *byte ^= counter_byte;
    }
    out
}

fn chunk_aad(plaintext_len: u64, chunk_index: u64) -> [u8; 16] {
    let mut aad = [0u8; 16];
    aad[..8].copy_from_slice(&plaintext_len.to_be_bytes());
    aad[8..].copy_from_slice(&chunk_index.to_be_bytes());
    aad
}

async fn emit_progress(
    progress: &Option<tokio::sync::mpsc::UnboundedSender<ProgressEvent>>,
    bytes_done: u64,
    bytes_total: u64,
    last_milestone: &mut u64,
) {
    if bytes_total == 0 {
        return;
    }
    let milestone = (bytes_done * 5 / bytes_total).min(5);
    if milestone > *last_milestone {
        *last_milestone = milestone;
        trace!(bytes_done, bytes_total, percent = milestone * 20, "envelope progress");
        if let Some(tx) = progress {
            let _ = tx.send(ProgressEvent { bytes_done, bytes_total });
        }
    }
}

/// Remove a partially written output file, best-effort, on any failure path.
async fn cleanup_partial(path: &Path) {
    let _ = tokio::fs::remove_file(path).await;
}

/// Stream-encrypt `source` into `dest` under `dek`, writing the envelope header and
/// length-prefixed AEAD chunks.
#[instrument(level = "info", skip(dek, options), fields(chunk_size = options.chunk_size))]
pub async fn encrypt_file(
    source: &Path,
    dest: &Path,
    dek: &SecureBuffer,
    options: &EnvelopeOptions,
) -> Result<(), EnvelopeError> {
    header::validate_chunk_size(options.chunk_size)?;

    let mut src = File::open(source).await.map_err(|e| EnvelopeError::Io { operation: "open source", source: e })?;
    let metadata = src.metadata().await.map_err(|e| EnvelopeError::Io { operation: "stat source", source: e })?;
    let plaintext_len = metadata.len();

    let mut base_nonce = [0u8; NONCE_LEN];
    rand::RngCore::fill_bytes(&mut rand::rng(), &mut base_nonce);
    let header = EnvelopeHeader { base_nonce, plaintext_len };

    let mut dst = File::create(dest).await.map_err(|e| EnvelopeError::Io { operation: "create dest", source: e })?;
    if let Err(e) = dst.write_all(&header.encode()).await {
        cleanup_partial(dest).await;
        return Err(EnvelopeError::Io { operation: "write header", source: e });
    }

    let cipher = cipher_from_dek(dek)?;

    let mut buf = vec![0u8; options.chunk_size as usize];
    let mut chunk_index: u64 = 0;
    let mut bytes_done: u64 = 0;
    let mut last_milestone = 0u64;

    loop {
        let n = match src.read(&mut buf).await {
            Ok(n) => n,
            Err(e) => {
                cleanup_partial(dest).await;
                return Err(EnvelopeError::Io { operation: "read source chunk", source: e });
            }
        };
        if n == 0 {
            break;
        }
        if chunk_index >= u64::from(u32::MAX) {
            cleanup_partial(dest).await;
            return Err(EnvelopeError::TooManyChunks);
        }

        let nonce_bytes = nonce_for_chunk(&base_nonce, chunk_index);
        let aad = chunk_aad(plaintext_len, chunk_index);
        let ciphertext = match cipher.encrypt(
            Nonce::from_slice(&nonce_bytes),
            Payload { msg: &buf[..n], aad: &aad },
        ) {
            Ok(ct) => ct,
            Err(_) => {
                cleanup_partial(dest).await;
                return Err(EnvelopeError::AuthenticationFailed { chunk_index });
            }
        };

        let len_prefix = (ciphertext.len() as u32).to_be_bytes();
        if let Err(e) = dst.write_all(&len_prefix).await {
            cleanup_partial(dest).await;
            return Err(EnvelopeError::Io { operation: "write chunk length", source: e });
        }
        if let Err(e) = dst.write_all(&ciphertext).await {
            cleanup_partial(dest).await;
            return Err(EnvelopeError::Io { operation: "write chunk body", source: e });
        }

        bytes_done += n as u64;
        chunk_index += 1;
        emit_progress(&options.progress, bytes_done, plaintext_len, &mut last_milestone).await;
    }

    if options.fsync {
        if let Err(e) = dst.sync_all().await {
            cleanup_partial(dest).await;
            return Err(EnvelopeError::Io { operation: "fsync dest", source: e });
        }
    }

    Ok(())
}

/// Stream-decrypt `source` into `dest` under `dek`, validating the header and every
/// chunk's length and authentication tag before any plaintext is written.
#[instrument(level = "info", skip(dek, options))]
pub async fn decrypt_file(
    source: &Path,
    dest: &Path,
    dek: &SecureBuffer,
    options: &EnvelopeOptions,
) -> Result<(), EnvelopeError> {
    let mut src = File::open(source).await.map_err(|e| EnvelopeError::Io { operation: "open source", source: e })?;
    let mut header_buf = [0u8; EnvelopeHeader::ENCODED_LEN];
    src.read_exact(&mut header_buf).await.map_err(|e| EnvelopeError::Io { operation: "read header", source: e })?;
    let header = EnvelopeHeader::decode(&header_buf)?;

    let cipher = cipher_from_dek(dek)?;

    let mut dst = File::create(dest).await.map_err(|e| EnvelopeError::Io { operation: "create dest", source: e })?;

    let mut chunk_index: u64 = 0;
    let mut bytes_done: u64 = 0;
    let mut last_milestone = 0u64;
    let max_ciphertext_chunk = u64::from(CHUNK_SIZE_MAX) + TAG_LEN as u64;

    loop {
        let mut len_buf = [0u8; 4];
        let read = src.read(&mut len_buf).await.map_err(|e| EnvelopeError::Io { operation: "read chunk length", source: e })?;
        if read == 0 {
            break;
        }
        if read != 4 {
            cleanup_partial(dest).await;
            return Err(EnvelopeError::Io {
                operation: "read chunk length",
                source: std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "truncated length prefix"),
            });
        }
        let declared = u32::from_be_bytes(len_buf) as u64;
        if declared > max_ciphertext_chunk {
            cleanup_partial(dest).await;
            return Err(EnvelopeError::ChunkTooLarge {
                chunk_index,
                declared,
                max: max_ciphertext_chunk,
            });
        }

        let mut ciphertext = vec![0u8; declared as usize];
        if let Err(e) = src.read_exact(&mut ciphertext).await {
            cleanup_partial(dest).await;
            return Err(EnvelopeError::Io { operation: "read chunk body", source: e });
        }

        let nonce_bytes = nonce_for_chunk(&header.base_nonce, chunk_index);
        let aad = chunk_aad(header.plaintext_len, chunk_index);
        let plaintext = match cipher.decrypt(Nonce::from_slice(&nonce_bytes), Payload { msg: &ciphertext, aad: &aad }) {
            Ok(pt) => pt,
            Err(_) => {
                cleanup_partial(dest).await;
                return Err(EnvelopeError::AuthenticationFailed { chunk_index });
            }
        };

        bytes_done += plaintext.len() as u64;
        if bytes_done > header.plaintext_len {
            cleanup_partial(dest).await;
            return Err(EnvelopeError::LengthExceeded {
                actual: bytes_done,
                expected: header.plaintext_len,
            });
        }

        if let Err(e) = dst.write_all(&plaintext).await {
            cleanup_partial(dest).await;
            return Err(EnvelopeError::Io { operation: "write plaintext chunk", source: e });
        }

        chunk_index += 1;
        if chunk_index > u64::from(u32::MAX) {
            cleanup_partial(dest).await;
            return Err(EnvelopeError::TooManyChunks);
        }
        emit_progress(&options.progress, bytes_done, header.plaintext_len, &mut last_milestone).await;
    }

    if bytes_done != header.plaintext_len {
        cleanup_partial(dest).await;
        return Err(EnvelopeError::LengthMismatch {
            actual: bytes_done,
            expected: header.plaintext_len,
        });
    }

    if options.fsync {
        dst.sync_all().await.map_err(|e| EnvelopeError::Io { operation: "fsync dest", source: e })?;
    }

    Ok(())
}
