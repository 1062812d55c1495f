//! NDJSON codec for the kernel socket.
//!
//! Wraps [`LinesCodec`] with a maximum line length so a kernel that never
//! terminates a line cannot grow the read buffer without bound. Use it with
//! [`tokio_util::codec::FramedRead`] on the read half and
//! [`tokio_util::codec::FramedWrite`] on the write half.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use crate::{AppError, Result};

/// Maximum accepted inbound line: 64 MiB. Cell outputs can embed images.
pub const MAX_LINE_BYTES: usize = 64 * 1_048_576;

/// Newline-delimited UTF-8 framing for kernel messages.
#[derive(Debug)]
pub struct KernelCodec(LinesCodec);

impl KernelCodec {
    /// Create a codec with the default [`MAX_LINE_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self(LinesCodec::new_with_max_length(MAX_LINE_BYTES))
    }
}

impl Default for KernelCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for KernelCodec {
    type Item = String;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.0.decode(src).map_err(map_codec_error)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.0.decode_eof(src).map_err(map_codec_error)
    }
}

impl Encoder<String> for KernelCodec {
    type Error = AppError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<()> {
        self.0.encode(item, dst).map_err(map_codec_error)
    }
}

fn map_codec_error(err: LinesCodecError) -> AppError {
    match err {
        LinesCodecError::MaxLineLengthExceeded => {
            AppError::Ipc(format!("line too long: exceeded {MAX_LINE_BYTES} bytes"))
        }
        LinesCodecError::Io(io_err) => AppError::Io(io_err.to_string()),
    }
}
