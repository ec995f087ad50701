//! Demultiplexing frames for non-tty exec output.
//!
//! Each record is an 8-byte header followed by the payload:
//!
//! ```text
//! [ selector | 0 | 0 | 0 | len (u32, big endian) ] [ payload; len ]
//! ```
//!
//! Selectors follow the Docker convention: 0 stdin, 1 stdout, 2 stderr.
//! Stdin frames are echoed output and go to stdout.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::StreamExt;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder, FramedRead};

pub const HEADER_LEN: usize = 8;
/// Largest payload accepted in one frame. Docker splits output well below this.
pub const MAX_PAYLOAD_LEN: usize = 8 * 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StdStream {
    Stdin = 0,
    Stdout = 1,
    Stderr = 2,
}

impl StdStream {
    fn from_selector(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(StdStream::Stdin),
            1 => Some(StdStream::Stdout),
            2 => Some(StdStream::Stderr),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StdFrame {
    pub stream: StdStream,
    pub payload: Bytes,
}

impl StdFrame {
    pub fn new(stream: StdStream, payload: impl Into<Bytes>) -> Self {
        Self {
            stream,
            payload: payload.into(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct StdFrameCodec;

impl Decoder for StdFrameCodec {
    type Item = StdFrame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<StdFrame>, io::Error> {
        if src.len() < HEADER_LEN {
            src.reserve(HEADER_LEN - src.len());
            return Ok(None);
        }

        let stream = StdStream::from_selector(src[0]).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unrecognized stream selector {}", src[0]),
            )
        })?;
        let len = u32::from_be_bytes([src[4], src[5], src[6], src[7]]) as usize;
        if len > MAX_PAYLOAD_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame payload of {len} bytes exceeds {MAX_PAYLOAD_LEN}"),
            ));
        }

        let total = HEADER_LEN + len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(len).freeze();
        Ok(Some(StdFrame { stream, payload }))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<StdFrame>, io::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("stream ended inside a frame ({} bytes buffered)", src.len()),
            )),
        }
    }
}

impl Encoder<StdFrame> for StdFrameCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: StdFrame, dst: &mut BytesMut) -> Result<(), io::Error> {
        if frame.payload.len() > MAX_PAYLOAD_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("frame payload of {} bytes is too large", frame.payload.len()),
            ));
        }
        let len = frame.payload.len() as u32;

        dst.reserve(HEADER_LEN + frame.payload.len());
        dst.put_u8(frame.stream as u8);
        dst.put_bytes(0, 3);
        dst.put_u32(len);
        dst.extend_from_slice(&frame.payload);
        Ok(())
    }
}

/// Splits a framed stream into `stdout` and `stderr` until `reader` ends.
/// Returns the number of payload bytes written.
pub async fn demux<R, O, E>(reader: R, stdout: &mut O, stderr: &mut E) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    O: AsyncWrite + Unpin + ?Sized,
    E: AsyncWrite + Unpin + ?Sized,
{
    let mut frames = FramedRead::new(reader, StdFrameCodec);
    let mut written = 0u64;

    while let Some(frame) = frames.next().await {
        let frame = frame?;
        match frame.stream {
            StdStream::Stdin | StdStream::Stdout => stdout.write_all(&frame.payload).await?,
            StdStream::Stderr => stderr.write_all(&frame.payload).await?,
        }
        written += frame.payload.len() as u64;
    }

    stdout.flush().await?;
    stderr.flush().await?;
    Ok(written)
}
