//! LSP base-protocol framing.
//!
//! `Content-Length: N\r\n\r\n{json}` over any async byte stream. A frame
//! whose header was read correctly but whose body is not JSON leaves the
//! stream in sync, so [`CodecError::is_recoverable`] reports it as such.
//! Every other error means the stream can no longer be trusted.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Frames above 4 MiB are refused.
const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// Longest header line accepted, terminator included.
const MAX_HEADER_LINE_BYTES: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unexpected EOF while reading headers")]
    TruncatedHeaders,
    #[error("header line exceeds {MAX_HEADER_LINE_BYTES} bytes")]
    HeaderTooLong,
    #[error("missing Content-Length header")]
    MissingContentLength,
    #[error("invalid Content-Length value '{0}'")]
    InvalidContentLength(String),
    #[error("Content-Length {0} exceeds maximum {MAX_FRAME_BYTES}")]
    Oversized(usize),
    #[error("malformed JSON body: {0}")]
    MalformedBody(serde_json::Error),
    #[error("serializing frame: {0}")]
    Serialize(serde_json::Error),
}

impl CodecError {
    /// Whether the next frame can still be read.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::MalformedBody(_))
    }
}

/// Reads framed JSON-RPC messages.
pub struct FrameReader<R> {
    reader: BufReader<R>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
        }
    }

    /// Read the next frame. `Ok(None)` is a clean EOF between frames.
    pub async fn read_frame(&mut self) -> Result<Option<serde_json::Value>, CodecError> {
        let Some(content_length) = self.read_headers().await? else {
            return Ok(None);
        };

        if content_length > MAX_FRAME_BYTES {
            return Err(CodecError::Oversized(content_length));
        }

        let mut body = vec![0u8; content_length];
        self.reader.read_exact(&mut body).await?;

        serde_json::from_slice(&body)
            .map(Some)
            .map_err(CodecError::MalformedBody)
    }

    async fn read_headers(&mut self) -> Result<Option<usize>, CodecError> {
        let mut content_length = None;
        let mut line = String::new();
        let mut started = false;

        loop {
            line.clear();
            let read = (&mut self.reader)
                .take(MAX_HEADER_LINE_BYTES as u64)
                .read_line(&mut line)
                .await?;
            if read == 0 {
                if started {
                    return Err(CodecError::TruncatedHeaders);
                }
                return Ok(None);
            }
            if read == MAX_HEADER_LINE_BYTES && !line.ends_with('\n') {
                return Err(CodecError::HeaderTooLong);
            }
            started = true;

            let trimmed = line.trim();
            if trimmed.is_empty() {
                break;
            }

            if let Some((key, value)) = trimmed.split_once(':')
                && key.trim().eq_ignore_ascii_case("Content-Length")
            {
                let value = value.trim();
                let len = value
                    .parse()
                    .map_err(|_| CodecError::InvalidContentLength(value.to_string()))?;
                content_length = Some(len);
            }
        }

        content_length
            .map(Some)
            .ok_or(CodecError::MissingContentLength)
    }
}

/// Writes framed JSON-RPC messages.
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub async fn write_frame(&mut self, msg: &serde_json::Value) -> Result<(), CodecError> {
        let body = serde_json::to_string(msg).map_err(CodecError::Serialize)?;
        let header = format!("Content-Length: {}\r\n\r\n", body.len());

        self.writer.write_all(header.as_bytes()).await?;
        self.writer.write_all(body.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }
}
