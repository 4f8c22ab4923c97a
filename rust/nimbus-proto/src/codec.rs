//! Length-prefixed frame codec
//!
//! Every control-plane message travels as a u32 little-endian length prefix
//! followed by the bincode-encoded record.

use crate::{ProtoError, ProtoResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame; anything larger is a protocol violation
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Serialize a message to its wire bytes (no frame prefix)
pub fn to_bytes<T: Serialize>(msg: &T) -> ProtoResult<Vec<u8>> {
    Ok(bincode::serialize(msg)?)
}

/// Deserialize a message from its wire bytes
pub fn from_bytes<T: DeserializeOwned>(bytes: &[u8]) -> ProtoResult<T> {
    Ok(bincode::deserialize(bytes)?)
}

/// Prepend the length prefix to an encoded payload
pub fn encode_frame(payload: &[u8]) -> ProtoResult<Vec<u8>> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(ProtoError::FrameTooLarge(payload.len()));
    }
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Write one framed payload to the stream
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> ProtoResult<()> {
    let frame = encode_frame(payload)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one framed payload from the stream
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> ProtoResult<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf) as usize;

    if len > MAX_FRAME_LEN {
        return Err(ProtoError::FrameTooLarge(len));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{GenericResponse, ThreadStatus};

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let status = ThreadStatus {
            ip: "10.0.0.1".to_string(),
            tid: 2,
            running: true,
            utilization: 0.25,
            functions: vec!["incr".to_string()],
            ..Default::default()
        };
        let bytes = to_bytes(&status).unwrap();

        let mut buf = Vec::new();
        write_frame(&mut buf, &bytes).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let payload = read_frame(&mut cursor).await.unwrap();
        let decoded: ThreadStatus = from_bytes(&payload).unwrap();
        assert_eq!(decoded, status);
    }

    #[tokio::test]
    async fn test_multiple_frames_preserve_order() {
        let mut buf = Vec::new();
        for i in 0..3u32 {
            let resp = GenericResponse::ok_with_id(format!("id-{i}"));
            write_frame(&mut buf, &to_bytes(&resp).unwrap()).await.unwrap();
        }

        let mut cursor = std::io::Cursor::new(buf);
        for i in 0..3u32 {
            let payload = read_frame(&mut cursor).await.unwrap();
            let resp: GenericResponse = from_bytes(&payload).unwrap();
            assert_eq!(resp.response_id, Some(format!("id-{i}")));
        }
    }

    #[test]
    fn test_oversized_frame_is_rejected() {
        let err = encode_frame(&vec![0u8; MAX_FRAME_LEN + 1]).unwrap_err();
        assert!(matches!(err, crate::ProtoError::FrameTooLarge(_)));
    }
}
