//! Length-prefixed MessagePack framing.
//!
//! Frame layout: `[u32 big-endian body length][MessagePack body]`.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::PoolError;

/// Default upper bound for a single frame body (256 MiB).
pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024 * 1024;

/// Serializer context shared by the controller-side transport and the
/// worker entry point. Both ends must agree on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireCodec {
    max_frame_bytes: usize,
}

impl WireCodec {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }

    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }

    /// Encode a message body (without the length prefix).
    pub fn encode<T: Serialize>(&self, message: &T) -> Result<Vec<u8>, PoolError> {
        let body = rmp_serde::to_vec_named(message)?;
        self.check_len(body.len())?;
        Ok(body)
    }

    /// Decode a message body (without the length prefix).
    pub fn decode<T: DeserializeOwned>(&self, body: &[u8]) -> Result<T, PoolError> {
        Ok(rmp_serde::from_slice(body)?)
    }

    /// Serialize `message` and write it as one frame.
    pub async fn write_frame<W, T>(&self, writer: &mut W, message: &T) -> Result<(), PoolError>
    where
        W: AsyncWrite + Unpin,
        T: Serialize,
    {
        let body = self.encode(message)?;
        // check_len bounds body.len() well below u32::MAX
        writer.write_u32(body.len() as u32).await?;
        writer.write_all(&body).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read one frame and deserialize it.
    ///
    /// Returns `Ok(None)` when the peer closed the connection cleanly before
    /// a new frame started.
    pub async fn read_frame<R, T>(&self, reader: &mut R) -> Result<Option<T>, PoolError>
    where
        R: AsyncRead + Unpin,
        T: DeserializeOwned,
    {
        let len = match reader.read_u32().await {
            Ok(len) => len as usize,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        self.check_len(len)?;

        let mut body = vec![0u8; len];
        reader.read_exact(&mut body).await?;
        self.decode(&body).map(Some)
    }

    fn check_len(&self, len: usize) -> Result<(), PoolError> {
        if len > self.max_frame_bytes || len > u32::MAX as usize {
            return Err(PoolError::Communication(format!(
                "frame of {len} bytes exceeds limit of {} bytes",
                self.max_frame_bytes
            )));
        }
        Ok(())
    }
}

impl Default for WireCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Reply, Request};
    use serde_json::json;
    use uuid::Uuid;

    #[tokio::test]
    async fn frame_roundtrip_over_duplex() {
        let codec = WireCodec::default();
        let (mut a, mut b) = tokio::io::duplex(1024);

        let reply = Reply::Result {
            id: Uuid::new_v4(),
            value: json!({"a": [1, 2.5, {"b": null}], "c": "text"}),
        };
        codec.write_frame(&mut a, &reply).await.unwrap();

        let decoded: Reply = codec.read_frame(&mut b).await.unwrap().unwrap();
        assert_eq!(decoded, reply);
    }

    #[tokio::test]
    async fn clean_eof_reads_as_none() {
        let codec = WireCodec::default();
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);

        let frame: Option<Request> = codec.read_frame(&mut b).await.unwrap();
        assert!(frame.is_none());
    }

    #[tokio::test]
    async fn truncated_body_is_an_error() {
        let codec = WireCodec::default();
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_u32(32).await.unwrap();
        a.write_all(&[0x90, 0x01]).await.unwrap();
        drop(a);

        let result: Result<Option<Request>, _> = codec.read_frame(&mut b).await;
        assert!(result.is_err());
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let codec = WireCodec::new(8);
        let err = codec
            .encode(&json!("a string that is clearly longer than eight bytes"))
            .unwrap_err();
        assert!(matches!(err, PoolError::Communication(_)));
    }
}
