//! rollcall-wire — Frame envelope codec for the ingest boundary.
//!
//! Each message on the wire is a 4-byte big-endian length prefix, a JSON
//! metadata block (capture timestamp plus decoded detections), then an
//! opaque image payload the tracker never looks at:
//!
//! ```text
//! [u32 meta_len][meta JSON, meta_len bytes][image payload, image_len bytes]
//! ```
//!
//! `image_len` lives inside the metadata block; the reader skips the
//! payload so display pipelines can share the stream with the tracker.

use bytes::{BufMut, BytesMut};
use chrono::{DateTime, Utc};
use rollcall_core::Detection;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Hard ceiling on one message (metadata plus image payload).
pub const MAX_FRAME_BYTES: u32 = 10 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum WireError {
    #[error("frame too large: {len} bytes (max {MAX_FRAME_BYTES})")]
    FrameTooLarge { len: u64 },
    #[error("invalid envelope metadata: {0}")]
    InvalidMetadata(#[from] serde_json::Error),
    #[error("stream truncated mid-envelope")]
    Truncated,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One decoded frame batch as it crosses the ingest boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameEnvelope {
    /// Capture timestamp; non-decreasing per connection.
    pub captured_at: DateTime<Utc>,
    /// Zero or more detections for this frame.
    #[serde(default)]
    pub detections: Vec<Detection>,
    /// Bytes of image payload following the metadata block.
    #[serde(default)]
    pub image_len: u32,
}

impl FrameEnvelope {
    pub fn new(captured_at: DateTime<Utc>, detections: Vec<Detection>) -> Self {
        Self {
            captured_at,
            detections,
            image_len: 0,
        }
    }
}

/// Encode an envelope (and its image payload, if any) to a buffer.
pub fn encode(envelope: &FrameEnvelope, image: &[u8]) -> Result<Vec<u8>, WireError> {
    debug_assert_eq!(envelope.image_len as usize, image.len());
    let meta = serde_json::to_vec(envelope)?;
    let total = meta.len() as u64 + image.len() as u64;
    if total > MAX_FRAME_BYTES as u64 {
        return Err(WireError::FrameTooLarge { len: total });
    }
    let mut buf = BytesMut::with_capacity(4 + meta.len() + image.len());
    buf.put_u32(meta.len() as u32);
    buf.put_slice(&meta);
    buf.put_slice(image);
    Ok(buf.to_vec())
}

/// Write one envelope to an async stream.
pub async fn write_envelope<W>(
    writer: &mut W,
    envelope: &FrameEnvelope,
    image: &[u8],
) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    let buf = encode(envelope, image)?;
    writer.write_all(&buf).await?;
    Ok(())
}

/// Read one envelope from an async stream, skipping its image payload.
///
/// Returns `Ok(None)` on clean end-of-stream (EOF at a message boundary).
/// EOF inside a message is [`WireError::Truncated`].
pub async fn read_envelope<R>(reader: &mut R) -> Result<Option<FrameEnvelope>, WireError>
where
    R: AsyncRead + Unpin,
{
    let meta_len = match reader.read_u32().await {
        Ok(len) => len,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if meta_len > MAX_FRAME_BYTES {
        return Err(WireError::FrameTooLarge {
            len: meta_len as u64,
        });
    }

    let mut meta = vec![0u8; meta_len as usize];
    reader
        .read_exact(&mut meta)
        .await
        .map_err(eof_as_truncated)?;
    let envelope: FrameEnvelope = serde_json::from_slice(&meta)?;

    let total = meta_len as u64 + envelope.image_len as u64;
    if total > MAX_FRAME_BYTES as u64 {
        return Err(WireError::FrameTooLarge { len: total });
    }

    // Discard the image payload; the tracker's contract starts at the
    // decoded detections.
    let mut remaining = envelope.image_len as u64;
    let mut scratch = [0u8; 8192];
    while remaining > 0 {
        let take = remaining.min(scratch.len() as u64) as usize;
        let n = reader
            .read(&mut scratch[..take])
            .await
            .map_err(eof_as_truncated)?;
        if n == 0 {
            return Err(WireError::Truncated);
        }
        remaining -= n as u64;
    }

    Ok(Some(envelope))
}

fn eof_as_truncated(e: std::io::Error) -> WireError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        WireError::Truncated
    } else {
        WireError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn envelope_at(secs: i64, names: &[&str]) -> FrameEnvelope {
        let at = Utc.with_ymd_and_hms(2025, 9, 1, 8, 0, 0).unwrap()
            + chrono::Duration::seconds(secs);
        FrameEnvelope::new(at, names.iter().map(|n| Detection::new(*n)).collect())
    }

    #[tokio::test]
    async fn test_round_trip_without_image() {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);
        let sent = envelope_at(0, &["Garcia, Allen", "Unknown"]);
        write_envelope(&mut client, &sent, &[]).await.unwrap();
        drop(client);

        let got = read_envelope(&mut server).await.unwrap().unwrap();
        assert_eq!(got.captured_at, sent.captured_at);
        assert_eq!(got.detections.len(), 2);
        assert_eq!(got.detections[1].identity.as_deref(), Some("Unknown"));

        // Clean EOF after the last full message.
        assert!(read_envelope(&mut server).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_image_payload_is_skipped() {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);
        let image = vec![0xAB; 4096];
        let mut first = envelope_at(0, &["X"]);
        first.image_len = image.len() as u32;
        write_envelope(&mut client, &first, &image).await.unwrap();
        let second = envelope_at(1, &["Y"]);
        write_envelope(&mut client, &second, &[]).await.unwrap();
        drop(client);

        let got1 = read_envelope(&mut server).await.unwrap().unwrap();
        assert_eq!(got1.detections[0].identity.as_deref(), Some("X"));
        // The payload must not bleed into the next message.
        let got2 = read_envelope(&mut server).await.unwrap().unwrap();
        assert_eq!(got2.detections[0].identity.as_deref(), Some("Y"));
    }

    #[tokio::test]
    async fn test_truncated_metadata() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let buf = encode(&envelope_at(0, &["X"]), &[]).unwrap();
        client.write_all(&buf[..buf.len() - 3]).await.unwrap();
        drop(client);

        match read_envelope(&mut server).await {
            Err(WireError::Truncated) => {}
            other => panic!("expected Truncated, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_truncated_image_payload() {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);
        let mut env = envelope_at(0, &["X"]);
        env.image_len = 1000;
        let meta = serde_json::to_vec(&env).unwrap();
        let mut buf = BytesMut::new();
        buf.put_u32(meta.len() as u32);
        buf.put_slice(&meta);
        buf.put_slice(&[0u8; 100]); // only part of the declared payload
        client.write_all(&buf).await.unwrap();
        drop(client);

        match read_envelope(&mut server).await {
            Err(WireError::Truncated) => {}
            other => panic!("expected Truncated, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_oversize_prefix_rejected() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client
            .write_all(&(MAX_FRAME_BYTES + 1).to_be_bytes())
            .await
            .unwrap();
        drop(client);

        match read_envelope(&mut server).await {
            Err(WireError::FrameTooLarge { .. }) => {}
            other => panic!("expected FrameTooLarge, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_oversize_declared_image_rejected() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let mut env = envelope_at(0, &[]);
        env.image_len = MAX_FRAME_BYTES;
        let meta = serde_json::to_vec(&env).unwrap();
        let mut buf = BytesMut::new();
        buf.put_u32(meta.len() as u32);
        buf.put_slice(&meta);
        client.write_all(&buf).await.unwrap();
        drop(client);

        match read_envelope(&mut server).await {
            Err(WireError::FrameTooLarge { .. }) => {}
            other => panic!("expected FrameTooLarge, got {other:?}"),
        }
    }

    #[test]
    fn test_encode_rejects_oversize() {
        let env = envelope_at(0, &[]);
        let image = vec![0u8; (MAX_FRAME_BYTES + 1) as usize];
        let mut env = env;
        env.image_len = image.len() as u32;
        assert!(matches!(
            encode(&env, &image),
            Err(WireError::FrameTooLarge { .. })
        ));
    }
}
