use std::collections::VecDeque;
use std::io::{ErrorKind, Read};

use bytes::Bytes;

use crate::codec::{Frame, MAX_FRAME_LEN};
use crate::decoder::StreamDecoder;
use crate::error::{FrameError, Result};

const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Reads complete frames from any `Read` stream.
///
/// Handles partial reads and resync internally; callers always get whole
/// frames.
pub struct FrameReader<T> {
    inner: T,
    decoder: StreamDecoder,
    ready: VecDeque<Bytes>,
}

impl<T: Read> FrameReader<T> {
    /// Reader for the device protocol with the default frame limit.
    pub fn new(inner: T) -> Self {
        Self::with_decoder(inner, StreamDecoder::device_protocol(MAX_FRAME_LEN))
    }

    pub fn with_decoder(inner: T, decoder: StreamDecoder) -> Self {
        Self {
            inner,
            decoder,
            ready: VecDeque::new(),
        }
    }

    /// Read the next length-delimited frame (blocking), unverified.
    ///
    /// Returns `Err(FrameError::ConnectionClosed)` when EOF is reached.
    pub fn read_raw(&mut self) -> Result<Bytes> {
        loop {
            if let Some(frame) = self.ready.pop_front() {
                return Ok(frame);
            }

            let mut chunk = [0u8; READ_CHUNK_SIZE];
            let read = match self.inner.read(&mut chunk) {
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            };

            if read == 0 {
                return Err(FrameError::ConnectionClosed);
            }

            self.ready.extend(self.decoder.feed(&chunk[..read]));
        }
    }

    /// Read the next frame that passes verification.
    ///
    /// Frames with a bad checksum are logged and skipped.
    pub fn read_frame(&mut self) -> Result<Frame> {
        loop {
            let raw = self.read_raw()?;
            let len = raw.len();
            match Frame::parse(raw) {
                Some(frame) => return Ok(frame),
                None => tracing::debug!(len, "skipping frame that failed verification"),
            }
        }
    }

    pub fn decoder(&self) -> &StreamDecoder {
        &self.decoder
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consume the reader and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }
}
