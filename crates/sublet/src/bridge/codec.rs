//! Framed codec for the parent-worker channel.
//!
//! LengthDelimitedCodec does the framing (4-byte big-endian length prefix),
//! serde_json does the payload. Works over any AsyncRead/AsyncWrite, which on
//! the real channel is the child's stdin/stdout pair.

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Frames larger than this are refused in both directions.
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

pub struct JsonCodec<T> {
    inner: LengthDelimitedCodec,
    _phantom: PhantomData<T>,
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .max_frame_length(MAX_FRAME_LENGTH)
                .new_codec(),
            _phantom: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Decoder for JsonCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(bytes) = self.inner.decode(src)? else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

impl<T: Serialize> Encoder<T> for JsonCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        // Must stay out of WorkerTracingLayer: shipping this event would encode
        // another frame, which would log again.
        tracing::trace!(json_size_bytes = json.len(), "Encoding frame");
        self.inner.encode(Bytes::from(json), dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::argument::SerializedArgument;
    use crate::bridge::protocol::{Message, Severity};

    #[test]
    fn codec_roundtrip_message() {
        let mut codec = JsonCodec::<Message>::new();
        let mut buf = BytesMut::new();

        let msg = Message::TerminalWrite {
            terminal_provider_id: 3,
            data: "compiling\n".to_string(),
            severity: Severity::Verbose,
        };
        codec.encode(msg.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();

        assert_eq!(decoded, msg);
        assert!(buf.is_empty());
    }

    #[test]
    fn codec_preserves_order_of_queued_frames() {
        let mut codec = JsonCodec::<Message>::new();
        let mut buf = BytesMut::new();

        codec
            .encode(
                Message::RequestScopedLogger {
                    logger_name: "lint".to_string(),
                },
                &mut buf,
            )
            .unwrap();
        codec
            .encode(
                Message::Exit {
                    error: SerializedArgument::undefined(),
                },
                &mut buf,
            )
            .unwrap();

        assert!(matches!(
            codec.decode(&mut buf).unwrap(),
            Some(Message::RequestScopedLogger { .. })
        ));
        assert!(matches!(
            codec.decode(&mut buf).unwrap(),
            Some(Message::Exit { .. })
        ));
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn codec_waits_for_complete_frame() {
        let mut codec = JsonCodec::<Message>::new();
        let mut full = BytesMut::new();
        codec
            .encode(
                Message::Exit {
                    error: SerializedArgument::Null,
                },
                &mut full,
            )
            .unwrap();

        let mut partial = BytesMut::from(&full[..full.len() - 1]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn codec_rejects_invalid_json() {
        let mut codec = JsonCodec::<Message>::new();
        let mut buf = BytesMut::new();
        let mut raw = LengthDelimitedCodec::builder()
            .length_field_length(4)
            .new_codec();
        raw.encode(Bytes::from_static(b"{not json"), &mut buf)
            .unwrap();

        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
