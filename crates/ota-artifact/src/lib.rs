//! Firmware artifact container.
//!
//! An artifact is a single signed blob delivered by the deployment server:
//!
//! ```text
//! +--------+-------------+----------------------+------------------+
//! | "OTA1" | u32 BE len  | header (JSON, `len`) | payload (raw)    |
//! +--------+-------------+----------------------+------------------+
//! ```
//!
//! The header names the artifact, lists the device types it may be installed
//! on, and declares the payload length and SHA-256 digest. It may carry a
//! detached ed25519 signature computed over the canonical header JSON with
//! the `signature` field absent.
//!
//! [`ArtifactReader`] consumes the container as a stream of chunks so a
//! multi-hundred-megabyte rootfs image never has to be buffered in memory:
//! compatibility is checked before any payload byte is handed out, and the
//! digest and length are verified when the stream ends.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::Bytes;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

const MAGIC: &[u8; 4] = b"OTA1";
const FORMAT_REVISION: u32 = 1;

/// Upper bound on the JSON header, far above anything a real header needs.
const MAX_HEADER_LEN: u32 = 1024 * 1024;

/// A source of raw artifact bytes, pulled chunk by chunk.
///
/// Implemented over an HTTP response body by the agent and over in-memory
/// buffers by tests. Returning `None` signals end of stream.
#[async_trait]
pub trait PayloadSource: Send {
    async fn next_chunk(&mut self) -> std::io::Result<Option<Bytes>>;
}

#[async_trait]
impl PayloadSource for Box<dyn PayloadSource> {
    async fn next_chunk(&mut self) -> std::io::Result<Option<Bytes>> {
        (**self).next_chunk().await
    }
}

/// In-memory payload source, served in fixed-size chunks.
#[derive(Debug)]
pub struct BufSource {
    data: Vec<u8>,
    pos: usize,
    chunk: usize,
}

impl BufSource {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            pos: 0,
            chunk: 4096,
        }
    }

    /// Override the chunk size, mainly to exercise header/payload splits
    /// landing on awkward boundaries.
    pub fn with_chunk_size(mut self, chunk: usize) -> Self {
        self.chunk = chunk.max(1);
        self
    }
}

#[async_trait]
impl PayloadSource for BufSource {
    async fn next_chunk(&mut self) -> std::io::Result<Option<Bytes>> {
        if self.pos >= self.data.len() {
            return Ok(None);
        }
        let end = (self.pos + self.chunk).min(self.data.len());
        let chunk = Bytes::copy_from_slice(&self.data[self.pos..end]);
        self.pos = end;
        Ok(Some(chunk))
    }
}

/// Artifact header, serialized as JSON inside the container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactHeader {
    /// Container format revision.
    pub format: u32,
    /// Artifact name, matched against deployment descriptors.
    pub name: String,
    /// Device types this artifact may be installed on.
    pub device_types: Vec<String>,
    /// Exact payload length in bytes.
    pub payload_size: u64,
    /// Hex-encoded SHA-256 digest of the payload.
    pub payload_sha256: String,
    /// Base64 ed25519 signature over the header JSON without this field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl ArtifactHeader {
    /// The byte string the signature is computed over.
    fn signing_bytes(&self) -> Result<Vec<u8>, ArtifactError> {
        let unsigned = ArtifactHeader {
            signature: None,
            ..self.clone()
        };
        Ok(serde_json::to_vec(&unsigned)?)
    }
}

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("artifact is truncated")]
    Truncated,
    #[error("bad artifact magic")]
    BadMagic,
    #[error("artifact header too large ({0} bytes)")]
    HeaderTooLarge(u32),
    #[error("malformed artifact header: {0}")]
    MalformedHeader(#[from] serde_json::Error),
    #[error("unsupported artifact format revision {0}")]
    UnsupportedFormat(u32),
    #[error("artifact {name} is not compatible with device type {device_type}")]
    Incompatible { name: String, device_type: String },
    #[error("payload length mismatch: header declares {expected} bytes, stream carried {actual}")]
    LengthMismatch { expected: u64, actual: u64 },
    #[error("payload checksum mismatch")]
    ChecksumMismatch,
    #[error("artifact signature rejected")]
    BadSignature,
    #[error("artifact is unsigned but a trust key is configured")]
    Unsigned,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Streaming artifact reader.
///
/// `open` consumes the magic, header length, and header, and verifies the
/// signature when a trust key is supplied. Payload bytes are then pulled via
/// [`ArtifactReader::next_payload_chunk`], which accounts length and digest
/// and fails the final chunk request on any mismatch.
#[derive(Debug)]
pub struct ArtifactReader<S> {
    source: S,
    header: ArtifactHeader,
    pending: Option<Bytes>,
    hasher: Sha256,
    read: u64,
    finished: bool,
}

impl<S: PayloadSource> ArtifactReader<S> {
    pub async fn open(
        mut source: S,
        trust_key: Option<&VerifyingKey>,
    ) -> Result<Self, ArtifactError> {
        let mut buf: Vec<u8> = Vec::new();
        fill(&mut source, &mut buf, 8).await?;

        if &buf[..4] != MAGIC {
            return Err(ArtifactError::BadMagic);
        }
        let header_len = u32::from_be_bytes(buf[4..8].try_into().expect("4 bytes"));
        if header_len > MAX_HEADER_LEN {
            return Err(ArtifactError::HeaderTooLarge(header_len));
        }

        let total = 8 + header_len as usize;
        fill(&mut source, &mut buf, total).await?;

        let header: ArtifactHeader = serde_json::from_slice(&buf[8..total])?;
        if header.format != FORMAT_REVISION {
            return Err(ArtifactError::UnsupportedFormat(header.format));
        }

        match (&header.signature, trust_key) {
            (Some(sig), Some(key)) => {
                let msg = header.signing_bytes()?;
                let raw = BASE64.decode(sig).map_err(|_| ArtifactError::BadSignature)?;
                let sig =
                    Signature::from_slice(&raw).map_err(|_| ArtifactError::BadSignature)?;
                key.verify(&msg, &sig)
                    .map_err(|_| ArtifactError::BadSignature)?;
            }
            (None, Some(_)) => return Err(ArtifactError::Unsigned),
            // No trust key configured: nothing to verify against.
            (_, None) => {}
        }

        let pending = if buf.len() > total {
            Some(Bytes::copy_from_slice(&buf[total..]))
        } else {
            None
        };

        Ok(Self {
            source,
            header,
            pending,
            hasher: Sha256::new(),
            read: 0,
            finished: false,
        })
    }

    pub fn header(&self) -> &ArtifactHeader {
        &self.header
    }

    /// Reject the artifact unless `device_type` is among the declared
    /// compatible types.
    pub fn ensure_compatible(&self, device_type: &str) -> Result<(), ArtifactError> {
        if self.header.device_types.iter().any(|t| t == device_type) {
            Ok(())
        } else {
            Err(ArtifactError::Incompatible {
                name: self.header.name.clone(),
                device_type: device_type.to_string(),
            })
        }
    }

    /// Next verified payload chunk, or `None` once the payload is complete.
    ///
    /// The terminal call performs the length and digest checks, so a caller
    /// must drain the stream to `None` to know the payload was intact.
    pub async fn next_payload_chunk(&mut self) -> Result<Option<Bytes>, ArtifactError> {
        if self.finished {
            return Ok(None);
        }
        loop {
            let chunk = match self.pending.take() {
                Some(chunk) => Some(chunk),
                None => self.source.next_chunk().await?,
            };
            match chunk {
                Some(chunk) if chunk.is_empty() => continue,
                Some(chunk) => {
                    self.read += chunk.len() as u64;
                    if self.read > self.header.payload_size {
                        return Err(ArtifactError::LengthMismatch {
                            expected: self.header.payload_size,
                            actual: self.read,
                        });
                    }
                    self.hasher.update(&chunk);
                    return Ok(Some(chunk));
                }
                None => {
                    self.finished = true;
                    if self.read != self.header.payload_size {
                        return Err(ArtifactError::LengthMismatch {
                            expected: self.header.payload_size,
                            actual: self.read,
                        });
                    }
                    let digest = hex::encode(std::mem::take(&mut self.hasher).finalize());
                    if !digest.eq_ignore_ascii_case(&self.header.payload_sha256) {
                        return Err(ArtifactError::ChecksumMismatch);
                    }
                    return Ok(None);
                }
            }
        }
    }
}

async fn fill<S: PayloadSource>(
    source: &mut S,
    buf: &mut Vec<u8>,
    want: usize,
) -> Result<(), ArtifactError> {
    while buf.len() < want {
        match source.next_chunk().await? {
            Some(chunk) => buf.extend_from_slice(&chunk),
            None => return Err(ArtifactError::Truncated),
        }
    }
    Ok(())
}

/// Builds artifact containers. Used by packaging tooling and tests.
pub struct ArtifactWriter {
    name: String,
    device_types: Vec<String>,
}

impl ArtifactWriter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            device_types: Vec::new(),
        }
    }

    pub fn compatible_with(mut self, device_type: impl Into<String>) -> Self {
        self.device_types.push(device_type.into());
        self
    }

    /// Assemble the container, signing the header when a key is given.
    pub fn write(
        self,
        payload: &[u8],
        signing_key: Option<&SigningKey>,
    ) -> Result<Vec<u8>, ArtifactError> {
        let mut header = ArtifactHeader {
            format: FORMAT_REVISION,
            name: self.name,
            device_types: self.device_types,
            payload_size: payload.len() as u64,
            payload_sha256: hex::encode(Sha256::digest(payload)),
            signature: None,
        };
        if let Some(key) = signing_key {
            let sig = key.sign(&header.signing_bytes()?);
            header.signature = Some(BASE64.encode(sig.to_bytes()));
        }

        let header_json = serde_json::to_vec(&header)?;
        let mut out = Vec::with_capacity(8 + header_json.len() + payload.len());
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&(header_json.len() as u32).to_be_bytes());
        out.extend_from_slice(&header_json);
        out.extend_from_slice(payload);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_artifact(payload: &[u8], key: Option<&SigningKey>) -> Vec<u8> {
        ArtifactWriter::new("release-7")
            .compatible_with("vexpress-qemu")
            .write(payload, key)
            .expect("write artifact")
    }

    async fn drain<S: PayloadSource>(
        reader: &mut ArtifactReader<S>,
    ) -> Result<Vec<u8>, ArtifactError> {
        let mut out = Vec::new();
        while let Some(chunk) = reader.next_payload_chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    #[tokio::test]
    async fn test_roundtrip() {
        let payload = b"rootfs image bytes".to_vec();
        let raw = make_artifact(&payload, None);

        // Small chunks so the header/payload boundary falls mid-chunk.
        let source = BufSource::new(raw).with_chunk_size(7);
        let mut reader = ArtifactReader::open(source, None).await.unwrap();
        assert_eq!(reader.header().name, "release-7");
        reader.ensure_compatible("vexpress-qemu").unwrap();

        let got = drain(&mut reader).await.unwrap();
        assert_eq!(got, payload);
    }

    #[tokio::test]
    async fn test_incompatible_device_type() {
        let raw = make_artifact(b"payload", None);
        let reader = ArtifactReader::open(BufSource::new(raw), None).await.unwrap();
        let err = reader.ensure_compatible("hammer").unwrap_err();
        assert!(matches!(err, ArtifactError::Incompatible { .. }));
    }

    #[tokio::test]
    async fn test_bad_magic() {
        let mut raw = make_artifact(b"payload", None);
        raw[0] = b'X';
        let err = ArtifactReader::open(BufSource::new(raw), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ArtifactError::BadMagic));
    }

    #[tokio::test]
    async fn test_truncated_header() {
        let raw = make_artifact(b"payload", None);
        let cut = raw[..10].to_vec();
        let err = ArtifactReader::open(BufSource::new(cut), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ArtifactError::Truncated));
    }

    #[tokio::test]
    async fn test_short_payload() {
        let raw = make_artifact(b"payload bytes here", None);
        let cut = raw[..raw.len() - 5].to_vec();
        let mut reader = ArtifactReader::open(BufSource::new(cut), None).await.unwrap();
        let err = drain(&mut reader).await.unwrap_err();
        assert!(matches!(err, ArtifactError::LengthMismatch { .. }));
    }

    #[tokio::test]
    async fn test_corrupt_payload() {
        let mut raw = make_artifact(b"payload bytes here", None);
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        let mut reader = ArtifactReader::open(BufSource::new(raw), None).await.unwrap();
        let err = drain(&mut reader).await.unwrap_err();
        assert!(matches!(err, ArtifactError::ChecksumMismatch));
    }

    #[tokio::test]
    async fn test_signed_roundtrip() {
        let key = SigningKey::from_bytes(&rand::random::<[u8; 32]>());
        let raw = make_artifact(b"signed payload", Some(&key));

        let mut reader = ArtifactReader::open(BufSource::new(raw), Some(&key.verifying_key()))
            .await
            .unwrap();
        let got = drain(&mut reader).await.unwrap();
        assert_eq!(got, b"signed payload");
    }

    #[tokio::test]
    async fn test_signature_from_wrong_key_rejected() {
        let key = SigningKey::from_bytes(&rand::random::<[u8; 32]>());
        let other = SigningKey::from_bytes(&rand::random::<[u8; 32]>());
        let raw = make_artifact(b"signed payload", Some(&key));

        let err = ArtifactReader::open(BufSource::new(raw), Some(&other.verifying_key()))
            .await
            .unwrap_err();
        assert!(matches!(err, ArtifactError::BadSignature));
    }

    #[tokio::test]
    async fn test_unsigned_rejected_when_trust_key_configured() {
        let key = SigningKey::from_bytes(&rand::random::<[u8; 32]>());
        let raw = make_artifact(b"payload", None);

        let err = ArtifactReader::open(BufSource::new(raw), Some(&key.verifying_key()))
            .await
            .unwrap_err();
        assert!(matches!(err, ArtifactError::Unsigned));
    }

    #[tokio::test]
    async fn test_signature_ignored_without_trust_key() {
        let key = SigningKey::from_bytes(&rand::random::<[u8; 32]>());
        let raw = make_artifact(b"payload", Some(&key));

        let mut reader = ArtifactReader::open(BufSource::new(raw), None).await.unwrap();
        assert!(drain(&mut reader).await.is_ok());
    }
}
