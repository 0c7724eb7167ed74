//! Frame I/O over QUIC streams.

use quinn::{RecvStream, SendStream};
use tracing::trace;

use crate::error::ProtocolError;
use crate::wire::{decode_frame_len, encode_frame};

/// Writes length-prefixed frames to a QUIC send stream.
pub struct FrameSender {
    stream: SendStream,
}

impl FrameSender {
    pub fn new(stream: SendStream) -> Self {
        Self { stream }
    }

    /// Send one frame.
    pub async fn send(&mut self, payload: &[u8]) -> Result<(), ProtocolError> {
        let frame = encode_frame(payload)?;
        self.stream
            .write_all(&frame)
            .await
            .map_err(|e| ProtocolError::Connection(e.to_string()))?;
        trace!(len = payload.len(), "sent frame");
        Ok(())
    }

    /// Finish the stream (signal no more data).
    pub fn finish(mut self) -> Result<(), ProtocolError> {
        self.stream
            .finish()
            .map_err(|e| ProtocolError::Connection(e.to_string()))
    }
}

/// Reads length-prefixed frames from a QUIC recv stream.
pub struct FrameReceiver {
    stream: RecvStream,
}

impl FrameReceiver {
    pub fn new(stream: RecvStream) -> Self {
        Self { stream }
    }

    /// Receive one frame.
    ///
    /// Returns `None` if the stream has been cleanly closed by the peer.
    pub async fn recv(&mut self) -> Result<Option<Vec<u8>>, ProtocolError> {
        let mut header = [0u8; 4];
        match self.stream.read_exact(&mut header).await {
            Ok(()) => {}
            Err(quinn::ReadExactError::FinishedEarly(_)) => return Ok(None),
            Err(quinn::ReadExactError::ReadError(e)) => {
                return Err(ProtocolError::Connection(e.to_string()));
            }
        }

        let len = decode_frame_len(header)?;
        let mut payload = vec![0u8; len];
        match self.stream.read_exact(&mut payload).await {
            Ok(()) => {}
            Err(quinn::ReadExactError::FinishedEarly(_)) => {
                return Err(ProtocolError::StreamClosed);
            }
            Err(quinn::ReadExactError::ReadError(e)) => {
                return Err(ProtocolError::Connection(e.to_string()));
            }
        }

        trace!(len, "received frame");
        Ok(Some(payload))
    }
}
