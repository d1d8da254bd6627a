//! Length-prefixed stream decoder with header resynchronization.
//!
//! Stream transports deliver arbitrary chunks. [`StreamDecoder`] buffers
//! them, finds frame boundaries with a pluggable length function and,
//! when the configured head does not match, discards bytes one at a time
//! until it reappears.

use std::fmt;

use bytes::{Bytes, BytesMut};

use crate::codec::{self, LENGTH_PROBE_LEN, MAGIC, MAX_FRAME_LEN, MIN_FRAME_LEN};
use crate::error::ProtocolError;

/// Computes the total length of the frame starting at the buffer front.
///
/// Receives the decoder context, the number of bytes buffered and the
/// probe (the first `probe_len` bytes). `None`, zero, or a length outside
/// `probe_len..=max_frame_len`, marks the probe as a false header.
pub type LengthFn = Box<dyn Fn(&FrameContext, usize, &[u8]) -> Option<usize> + Send + Sync>;

/// Checks whether `probe` carries `expected_head` at `offset`.
pub type HeadValidator = Box<dyn Fn(&[u8], &[u8], usize) -> bool + Send + Sync>;

/// Observes bytes dropped during resync.
pub type DiscardHook = Box<dyn FnMut(&[u8]) + Send>;

/// Decoder settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecoderConfig {
    /// Expected head bytes. Empty disables resync.
    pub head: Vec<u8>,
    /// Offset of the head within the probe.
    pub head_offset: usize,
    /// Bytes that must be buffered before the length can be computed.
    pub probe_len: usize,
    /// Largest accepted frame; longer declared lengths are false headers.
    pub max_frame_len: usize,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            head: MAGIC.to_vec(),
            head_offset: 0,
            probe_len: LENGTH_PROBE_LEN,
            max_frame_len: MAX_FRAME_LEN,
        }
    }
}

impl DecoderConfig {
    /// Pure length-based framing with no head.
    pub fn headless(probe_len: usize, max_frame_len: usize) -> Self {
        Self {
            head: Vec::new(),
            head_offset: 0,
            probe_len,
            max_frame_len,
        }
    }

    /// Reject settings under which no frame could ever be emitted.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        let min_frame = self.probe_len.max(1);
        if self.max_frame_len < min_frame {
            return Err(out_of_range("max_frame_len", self.max_frame_len, min_frame, usize::MAX));
        }
        if !self.head.is_empty() {
            let head_end = self.head_offset.saturating_add(self.head.len());
            if head_end > self.probe_len {
                return Err(out_of_range("head end", head_end, self.head.len(), self.probe_len));
            }
        }
        Ok(())
    }
}

fn out_of_range(field: &'static str, value: usize, min: usize, max: usize) -> ProtocolError {
    let clamp = |v: usize| i64::try_from(v).unwrap_or(i64::MAX);
    ProtocolError::OutOfRange {
        field,
        value: clamp(value),
        min: clamp(min),
        max: clamp(max),
    }
}

/// Decoder state passed to the length function.
#[derive(Debug, Clone)]
pub struct FrameContext {
    config: DecoderConfig,
    frames_emitted: u64,
    bytes_discarded: u64,
}

impl FrameContext {
    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    pub fn frames_emitted(&self) -> u64 {
        self.frames_emitted
    }

    pub fn bytes_discarded(&self) -> u64 {
        self.bytes_discarded
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderState {
    AwaitingHeader,
    /// A declared length is known and more bytes are needed.
    AwaitingLength(usize),
}

/// Default head check: exact match at `offset`; an empty head matches anything.
pub fn exact_head(expected: &[u8], probe: &[u8], offset: usize) -> bool {
    if expected.is_empty() {
        return true;
    }
    match offset.checked_add(expected.len()) {
        Some(end) => probe.get(offset..end) == Some(expected),
        None => false,
    }
}

/// Default length function: the frame is everything buffered so far.
pub fn all_available(_ctx: &FrameContext, available: usize, _probe: &[u8]) -> Option<usize> {
    Some(available)
}

/// Length function for the device protocol: declared length plus the magic.
pub fn device_frame_length(_ctx: &FrameContext, _available: usize, probe: &[u8]) -> Option<usize> {
    let total = codec::length(probe)? + MAGIC.len();
    (total >= MIN_FRAME_LEN).then_some(total)
}

/// Incremental frame decoder.
///
/// One instance per connection. `feed` never blocks; it returns whatever
/// complete frames the buffered bytes contain.
pub struct StreamDecoder {
    ctx: FrameContext,
    length_fn: LengthFn,
    head_validator: HeadValidator,
    custom_validator: bool,
    discard_hook: Option<DiscardHook>,
    pending: Option<usize>,
    buf: BytesMut,
}

impl StreamDecoder {
    /// Decoder with the default length function and head check.
    pub fn new(config: DecoderConfig) -> Self {
        Self {
            ctx: FrameContext {
                config,
                frames_emitted: 0,
                bytes_discarded: 0,
            },
            length_fn: Box::new(all_available),
            head_validator: Box::new(exact_head),
            custom_validator: false,
            discard_hook: None,
            pending: None,
            buf: BytesMut::new(),
        }
    }

    /// Decoder for `55 AA` frames, bounded by `max_frame_len`.
    pub fn device_protocol(max_frame_len: usize) -> Self {
        let config = DecoderConfig {
            max_frame_len,
            ..DecoderConfig::default()
        };
        Self::new(config).with_length_fn(Box::new(device_frame_length))
    }

    pub fn with_length_fn(mut self, length_fn: LengthFn) -> Self {
        self.length_fn = length_fn;
        self
    }

    pub fn with_head_validator(mut self, validator: HeadValidator) -> Self {
        self.head_validator = validator;
        self.custom_validator = true;
        self
    }

    pub fn with_discard_hook(mut self, hook: DiscardHook) -> Self {
        self.discard_hook = Some(hook);
        self
    }

    pub fn context(&self) -> &FrameContext {
        &self.ctx
    }

    pub fn state(&self) -> DecoderState {
        match self.pending {
            Some(len) => DecoderState::AwaitingLength(len),
            None => DecoderState::AwaitingHeader,
        }
    }

    /// Bytes held by [`feed`](Self::feed) that are not yet part of a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Drop buffered bytes and any pending length.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.pending = None;
    }

    /// Append `chunk` and return every frame it completes, in order.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        let mut buf = std::mem::take(&mut self.buf);
        buf.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some(frame) = self.decode_from(&mut buf) {
            frames.push(frame);
        }
        self.buf = buf;
        frames
    }

    /// Decode at most one frame from the front of `buf`.
    ///
    /// Consumes the frame bytes and any discarded garbage; leaves a
    /// possible partial frame in place.
    pub fn decode_from(&mut self, buf: &mut BytesMut) -> Option<Bytes> {
        let probe_len = self.ctx.config.probe_len;
        loop {
            if let Some(len) = self.pending {
                if buf.len() < len {
                    return None;
                }
                return Some(self.emit(buf, len));
            }
            if buf.len() < probe_len || buf.is_empty() {
                return None;
            }

            let probe = &buf[..probe_len];
            if (self.head_validator)(
                &self.ctx.config.head,
                probe,
                self.ctx.config.head_offset,
            ) {
                let declared = (self.length_fn)(&self.ctx, buf.len(), probe);
                match declared {
                    // A zero-length frame would consume nothing.
                    Some(len) if len >= probe_len.max(1) && len <= self.ctx.config.max_frame_len => {
                        if buf.len() < len {
                            self.pending = Some(len);
                            return None;
                        }
                        return Some(self.emit(buf, len));
                    }
                    _ => self.discard(buf, 1),
                }
            } else {
                let skip = (1..buf.len())
                    .find(|&start| self.could_start_frame(&buf[start..]))
                    .unwrap_or(buf.len());
                self.discard(buf, skip);
            }
        }
    }

    fn emit(&mut self, buf: &mut BytesMut, len: usize) -> Bytes {
        self.pending = None;
        self.ctx.frames_emitted += 1;
        buf.split_to(len).freeze()
    }

    fn discard(&mut self, buf: &mut BytesMut, count: usize) {
        let dropped = buf.split_to(count);
        self.ctx.bytes_discarded += count as u64;
        tracing::trace!(count, "stream decoder discarded bytes");
        if let Some(hook) = self.discard_hook.as_mut() {
            hook(&dropped);
        }
    }

    /// Whether a frame could begin at the front of `window`.
    ///
    /// A window shorter than the probe is kept if it is a prefix of the head.
    fn could_start_frame(&self, window: &[u8]) -> bool {
        let config = &self.ctx.config;
        if window.len() >= config.probe_len {
            return (self.head_validator)(
                &config.head,
                &window[..config.probe_len],
                config.head_offset,
            );
        }
        if self.custom_validator {
            return true;
        }
        let seen = window.get(config.head_offset..).unwrap_or(&[]);
        let n = seen.len().min(config.head.len());
        seen[..n] == config.head[..n]
    }
}

impl fmt::Debug for StreamDecoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamDecoder")
            .field("ctx", &self.ctx)
            .field("state", &self.state())
            .field("buffered", &self.buf.len())
            .finish_non_exhaustive()
    }
}

#[cfg(feature = "async")]
mod codec_impl {
    use std::io;

    use bytes::{Bytes, BytesMut};
    use tokio_util::codec::{Decoder, Encoder};

    use super::StreamDecoder;

    impl Decoder for StreamDecoder {
        type Item = Bytes;
        type Error = io::Error;

        fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Bytes>> {
            Ok(self.decode_from(src))
        }

        fn decode_eof(&mut self, src: &mut BytesMut) -> io::Result<Option<Bytes>> {
            if let Some(frame) = self.decode_from(src) {
                return Ok(Some(frame));
            }
            if !src.is_empty() {
                let len = src.len();
                self.discard(src, len);
                self.pending = None;
            }
            Ok(None)
        }
    }

    /// Frames are already encoded; the encoder writes them verbatim.
    impl Encoder<Bytes> for StreamDecoder {
        type Error = io::Error;

        fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> io::Result<()> {
            dst.extend_from_slice(&item);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use proptest::prelude::*;

    use super::*;
    use crate::codec::{build_frame, verify, with_checksum, DeviceId};

    fn frame(command: u8, payload: &[u8]) -> Vec<u8> {
        let mut buf = build_frame(DeviceId::from(0x0A0B_0C0D), command, payload.len()).unwrap();
        let start = codec::PAYLOAD_OFFSET;
        buf[start..start + payload.len()].copy_from_slice(payload);
        with_checksum(buf).to_vec()
    }

    fn recording_decoder() -> (StreamDecoder, Arc<Mutex<Vec<u8>>>) {
        let discarded = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&discarded);
        let decoder = StreamDecoder::device_protocol(MAX_FRAME_LEN)
            .with_discard_hook(Box::new(move |bytes: &[u8]| sink.lock().unwrap().extend_from_slice(bytes)));
        (decoder, discarded)
    }

    #[test]
    fn splits_back_to_back_frames() {
        let mut wire = frame(0x03, b"\x00\x00\x00\x01abc");
        wire.extend(frame(0x01, &[0, 0, 0, 2, 1]));

        let mut decoder = StreamDecoder::device_protocol(MAX_FRAME_LEN);
        let frames = decoder.feed(&wire);

        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| verify(f)));
        assert_eq!(frames[1][codec::COMMAND_OFFSET], 0x01);
        assert_eq!(decoder.buffered(), 0);
        assert_eq!(decoder.context().frames_emitted(), 2);
    }

    #[test]
    fn waits_for_header_then_declared_length() {
        let wire = frame(0x04, &[0, 0, 0, 9]);
        let mut decoder = StreamDecoder::device_protocol(MAX_FRAME_LEN);

        assert!(decoder.feed(&wire[..3]).is_empty());
        assert_eq!(decoder.state(), DecoderState::AwaitingHeader);

        assert!(decoder.feed(&wire[3..6]).is_empty());
        assert_eq!(decoder.state(), DecoderState::AwaitingLength(wire.len()));

        let frames = decoder.feed(&wire[6..]);
        assert_eq!(frames, vec![Bytes::from(wire)]);
        assert_eq!(decoder.state(), DecoderState::AwaitingHeader);
    }

    #[test]
    fn garbage_before_header_is_discarded_through_hook() {
        let (mut decoder, discarded) = recording_decoder();
        let good = frame(0x04, &[0, 0, 0, 1]);
        let mut wire = vec![0x01, 0x02, 0x55, 0x03];
        wire.extend(&good);

        let frames = decoder.feed(&wire);

        assert_eq!(frames, vec![Bytes::from(good)]);
        assert_eq!(*discarded.lock().unwrap(), vec![0x01, 0x02, 0x55, 0x03]);
        assert_eq!(decoder.context().bytes_discarded(), 4);
    }

    #[test]
    fn partial_head_at_buffer_end_is_kept() {
        let (mut decoder, discarded) = recording_decoder();
        let good = frame(0x04, &[0, 0, 0, 1]);

        assert!(decoder.feed(&[0x00, 0x11, 0x22, 0x33, 0x55]).is_empty());
        assert_eq!(*discarded.lock().unwrap(), vec![0x00, 0x11, 0x22, 0x33]);
        assert_eq!(decoder.buffered(), 1);

        let frames = decoder.feed(&good[1..]);
        assert_eq!(frames, vec![Bytes::from(good)]);
    }

    #[test]
    fn false_header_with_bad_length_drops_one_byte() {
        let (mut decoder, discarded) = recording_decoder();
        let good = frame(0x04, &[0, 0, 0, 1]);
        // 55 AA with declared length 1 is shorter than any frame.
        let mut wire = vec![0x55, 0xAA, 0x00, 0x01];
        wire.extend(&good);

        let frames = decoder.feed(&wire);

        assert_eq!(frames, vec![Bytes::from(good)]);
        assert_eq!(*discarded.lock().unwrap(), vec![0x55, 0xAA, 0x00, 0x01]);
    }

    #[test]
    fn declared_length_above_limit_is_a_false_header() {
        let small = frame(0x04, &[0, 0, 0, 1]);
        let mut decoder = StreamDecoder::device_protocol(small.len());
        let mut wire = frame(0xFE, &[0u8; 32]);
        wire.extend(&small);

        let frames = decoder.feed(&wire);
        assert_eq!(frames, vec![Bytes::from(small)]);
    }

    #[test]
    fn length_fn_none_makes_progress() {
        let mut decoder = StreamDecoder::new(DecoderConfig::default())
            .with_length_fn(Box::new(|_: &FrameContext, _: usize, _: &[u8]| None));
        assert!(decoder.feed(&[0x55, 0xAA, 0x55, 0xAA, 0x00]).is_empty());
        assert!(decoder.buffered() < 4);
    }

    #[test]
    fn default_length_fn_takes_everything_available() {
        let mut decoder = StreamDecoder::new(DecoderConfig::default());
        let frames = decoder.feed(&[0x55, 0xAA, 1, 2, 3, 4, 5]);
        assert_eq!(frames, vec![Bytes::from_static(&[0x55, 0xAA, 1, 2, 3, 4, 5])]);
    }

    #[test]
    fn empty_head_is_pure_length_framing() {
        let mut decoder = StreamDecoder::new(DecoderConfig::headless(1, 255))
            .with_length_fn(Box::new(|_: &FrameContext, _: usize, probe: &[u8]| {
                Some(1 + probe[0] as usize)
            }));
        let frames = decoder.feed(&[2, 0xA, 0xB, 0, 3, 0xC]);
        assert_eq!(
            frames,
            vec![
                Bytes::from_static(&[2, 0xA, 0xB]),
                Bytes::from_static(&[0]),
            ]
        );
        assert_eq!(decoder.buffered(), 2);
        assert_eq!(decoder.context().bytes_discarded(), 0);
    }

    #[test]
    fn custom_head_validator_and_offset() {
        let config = DecoderConfig {
            head: vec![0x7E],
            head_offset: 1,
            probe_len: 2,
            max_frame_len: 16,
        };
        let mut decoder = StreamDecoder::new(config)
            .with_length_fn(Box::new(|_: &FrameContext, _: usize, probe: &[u8]| {
                Some(2 + probe[0] as usize)
            }))
            .with_head_validator(Box::new(|head: &[u8], probe: &[u8], offset: usize| {
                probe[offset] == head[0]
            }));

        let frames = decoder.feed(&[0xFF, 0x00, 1, 0x7E, 0x42]);
        assert_eq!(frames, vec![Bytes::from_static(&[1, 0x7E, 0x42])]);
    }

    #[test]
    fn reset_clears_pending_length() {
        let wire = frame(0x04, &[0, 0, 0, 9]);
        let mut decoder = StreamDecoder::device_protocol(MAX_FRAME_LEN);
        decoder.feed(&wire[..6]);
        decoder.reset();
        assert_eq!(decoder.state(), DecoderState::AwaitingHeader);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn zero_length_is_a_false_header() {
        let mut decoder = StreamDecoder::new(DecoderConfig::headless(0, 64))
            .with_length_fn(Box::new(|_: &FrameContext, _: usize, _: &[u8]| Some(0)));
        assert!(decoder.feed(&[1, 2, 3]).is_empty());
        assert_eq!(decoder.buffered(), 0);
        assert_eq!(decoder.context().bytes_discarded(), 3);
        assert_eq!(decoder.context().frames_emitted(), 0);
    }

    #[test]
    fn validate_rejects_unusable_configs() {
        assert!(DecoderConfig::default().validate().is_ok());
        assert!(DecoderConfig::headless(0, 1).validate().is_ok());

        let err = DecoderConfig::headless(0, 0).validate().unwrap_err();
        assert!(matches!(err, ProtocolError::OutOfRange { field: "max_frame_len", .. }));
        assert!(DecoderConfig::headless(8, 4).validate().is_err());

        let head_past_probe = DecoderConfig {
            head_offset: 3,
            ..DecoderConfig::default()
        };
        let err = head_past_probe.validate().unwrap_err();
        assert!(matches!(err, ProtocolError::OutOfRange { field: "head end", value: 5, .. }));
    }

    fn stream() -> impl Strategy<Value = Vec<u8>> {
        let garbage = proptest::collection::vec(any::<u8>().prop_filter("not magic", |b| *b != 0x55), 0..6);
        let payload = proptest::collection::vec(any::<u8>(), 0..24);
        proptest::collection::vec((garbage, payload), 1..6).prop_map(|parts| {
            let mut wire = Vec::new();
            for (junk, body) in parts {
                wire.extend(junk);
                wire.extend(frame(0xFE, &body));
            }
            wire
        })
    }

    proptest! {
        #[test]
        fn chunking_does_not_change_output(wire in stream(), cuts in proptest::collection::vec(any::<prop::sample::Index>(), 0..8)) {
            let whole = StreamDecoder::device_protocol(MAX_FRAME_LEN).feed(&wire);

            let mut points: Vec<usize> = cuts.iter().map(|c| c.index(wire.len() + 1)).collect();
            points.push(0);
            points.push(wire.len());
            points.sort_unstable();

            let mut decoder = StreamDecoder::device_protocol(MAX_FRAME_LEN);
            let mut chunked = Vec::new();
            for pair in points.windows(2) {
                chunked.extend(decoder.feed(&wire[pair[0]..pair[1]]));
            }

            prop_assert_eq!(whole, chunked);
        }

        #[test]
        fn resync_recovers_every_frame(wire in stream()) {
            let frames = StreamDecoder::device_protocol(MAX_FRAME_LEN).feed(&wire);
            prop_assert!(!frames.is_empty());
            prop_assert!(frames.iter().all(|f| verify(f)));
        }
    }

    #[cfg(feature = "async")]
    mod async_codec {
        use futures_util::{SinkExt, StreamExt};
        use tokio_util::codec::{FramedRead, FramedWrite};

        use super::*;

        #[tokio::test]
        async fn framed_read_yields_frames() {
            let mut wire = vec![0x00, 0x01];
            let first = frame(0x04, &[0, 0, 0, 1]);
            let second = frame(0x04, &[0, 0, 0, 2]);
            wire.extend(&first);
            wire.extend(&second);
            wire.push(0x55);

            let mut reader = FramedRead::new(&wire[..], StreamDecoder::device_protocol(MAX_FRAME_LEN));
            assert_eq!(reader.next().await.unwrap().unwrap(), Bytes::from(first));
            assert_eq!(reader.next().await.unwrap().unwrap(), Bytes::from(second));
            assert!(reader.next().await.is_none());
        }

        #[tokio::test]
        async fn framed_write_passes_frames_through() {
            let wire = Bytes::from(frame(0x09, &[0; 6]));
            let mut writer = FramedWrite::new(Vec::new(), StreamDecoder::device_protocol(MAX_FRAME_LEN));
            writer.send(wire.clone()).await.unwrap();
            assert_eq!(writer.get_ref().as_slice(), wire.as_ref());
        }
    }
}
