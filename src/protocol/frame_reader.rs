use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes, BytesMut};
use image::DynamicImage;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{trace, warn};

use crate::error::{YfpError, YfpResult};
use crate::protocol::frame_header::{parse_header, validate_header_len, FrameHeader, HEADER_LEN_PREFIX_SIZE};
use crate::protocol::payload_format::PayloadFormat;

/// A complete frame as received: the parsed header, the raw payload and the image it decoded to.
///  It is owned by the connection's read loop until it is handed to the pipeline.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub header: FrameHeader,
    pub payload: Bytes,
    pub image: DynamicImage,
    /// time spent decoding the payload that completed the frame
    pub decode_time: Duration,
}

#[derive(Debug)]
pub enum FrameEvent {
    Frame(RawFrame),
    /// The payload reached the size limit without completing. It was discarded, and the stream
    ///  continues with the next header.
    Dropped {
        header: FrameHeader,
        reason: YfpError,
    },
}

#[derive(Debug, Clone)]
pub struct FrameReaderConfig {
    pub max_payload_len: usize,
    pub read_chunk_size: usize,
    /// `None` blocks indefinitely
    pub read_timeout: Option<Duration>,
}

/// Runs the per-connection framing state machine
///  `header length -> header body -> payload -> (dispatch) -> header length ...`
///  over a byte stream, tolerating arbitrarily fragmented reads.
///
/// Reads are buffered, and bytes read past the end of a payload are kept for the next frame: a
///  peer may well send the next header before the previous image was consumed.
///
/// A payload is complete once it ends with the format's trailer and decodes. Decoding runs on
///  the blocking pool, and the decoded image travels on with the frame.
pub struct FrameReader<R> {
    stream: R,
    format: Arc<dyn PayloadFormat>,
    config: FrameReaderConfig,
    buf: BytesMut,
}

struct CompletePayload {
    payload: Bytes,
    image: DynamicImage,
    decode_time: Duration,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(stream: R, format: Arc<dyn PayloadFormat>, config: FrameReaderConfig) -> FrameReader<R> {
        FrameReader {
            stream,
            format,
            config,
            buf: BytesMut::new(),
        }
    }

    /// Returns `Ok(None)` if the peer closed the stream cleanly between frames. Any error leaves
    ///  the stream in an undefined position, and the connection should be closed.
    pub async fn next_frame(&mut self) -> YfpResult<Option<FrameEvent>> {
        let header_len = match self.read_header_len().await? {
            None => return Ok(None),
            Some(len) => len,
        };
        let header = self.read_header(header_len).await?;
        trace!(frame_id = header.frame_id(), header_len, "received frame header");

        self.read_payload(header).await
            .map(Some)
    }

    /// reads more bytes from the stream into the buffer, returning 0 on EOF
    async fn fill(&mut self) -> YfpResult<usize> {
        self.buf.reserve(self.config.read_chunk_size.max(1));
        with_timeout(self.config.read_timeout, self.stream.read_buf(&mut self.buf)).await
    }

    async fn read_header_len(&mut self) -> YfpResult<Option<usize>> {
        while self.buf.len() < HEADER_LEN_PREFIX_SIZE {
            if self.fill().await? == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "peer closed during header length").into());
            }
        }

        let mut raw = [0u8; HEADER_LEN_PREFIX_SIZE];
        raw.copy_from_slice(&self.buf.split_to(HEADER_LEN_PREFIX_SIZE));
        validate_header_len(raw)
            .map(Some)
    }

    async fn read_header(&mut self, header_len: usize) -> YfpResult<FrameHeader> {
        while self.buf.len() < header_len {
            if self.fill().await? == 0 {
                return Err(YfpError::TruncatedHeader { expected: header_len, actual: self.buf.len() });
            }
        }
        parse_header(&self.buf.split_to(header_len))
    }

    async fn read_payload(&mut self, header: FrameHeader) -> YfpResult<FrameEvent> {
        let max = self.config.max_payload_len;
        let mut scanned = 0;

        loop {
            let limit = self.buf.len().min(max);
            if let Some(complete) = self.find_complete_payload(scanned, limit).await {
                trace!(frame_id = header.frame_id(), len = complete.payload.len(), "received complete payload");
                self.buf.advance(complete.payload.len());
                return Ok(FrameEvent::Frame(RawFrame {
                    header,
                    payload: complete.payload,
                    image: complete.image,
                    decode_time: complete.decode_time,
                }));
            }
            scanned = limit;

            if self.buf.len() >= max {
                // exactly `max` bytes belong to the discarded payload, anything after that is
                //  the next frame
                self.buf.advance(max);
                return Ok(FrameEvent::Dropped {
                    header,
                    reason: YfpError::OversizedPayload { max },
                });
            }

            if self.fill().await? == 0 {
                return Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "peer closed during payload").into());
            }
        }
    }

    /// Tries every trailer that ends in `(scanned, limit]`, in stream order, and returns the first
    ///  candidate payload that decodes.
    async fn find_complete_payload(&self, scanned: usize, limit: usize) -> Option<CompletePayload> {
        let trailer = self.format.trailer();
        if trailer.is_empty() || limit < trailer.len() {
            return None;
        }

        // a trailer may straddle the boundary between previously scanned and new bytes
        let first_start = scanned.saturating_sub(trailer.len() - 1);
        let last_start = limit - trailer.len();
        let candidates = (first_start..=last_start)
            .filter(|&start| &self.buf[start..start + trailer.len()] == trailer)
            .map(|start| start + trailer.len())
            .collect::<Vec<_>>();

        for end in candidates {
            let payload = Bytes::copy_from_slice(&self.buf[..end]);
            let format = self.format.clone();
            let decoded = tokio::task::spawn_blocking(move || {
                let started = Instant::now();
                let result = format.decode(&payload);
                (payload, result, started.elapsed())
            }).await;

            match decoded {
                Ok((payload, Ok(image), decode_time)) => return Some(CompletePayload { payload, image, decode_time }),
                Ok((_, Err(e), _)) => trace!("{} byte payload candidate does not decode: {}", end, e),
                Err(e) => warn!("decoding a {} byte payload candidate failed: {}", end, e),
            }
        }
        None
    }
}

async fn with_timeout<T>(timeout: Option<Duration>, f: impl Future<Output = std::io::Result<T>>) -> YfpResult<T> {
    match timeout {
        None => Ok(f.await?),
        Some(timeout) => match tokio::time::timeout(timeout, f).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(YfpError::Timeout(timeout)),
        },
    }
}
