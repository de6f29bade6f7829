// Terminator-delimited frame accumulation with a single deadline and a size cap.
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::core::error::{Error, ErrorKind};
use crate::core::protocol::TERMINATOR;

pub const READ_CHUNK: usize = 4096;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FrameLimits {
    pub timeout: Duration,
    pub max_bytes: usize,
}

impl Default for FrameLimits {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            max_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

/// Reads until the peer closes or the buffer ends with the terminator.
///
/// The deadline covers the whole read, not each chunk. On expiry nothing
/// accumulated so far is returned.
pub async fn read_frame<R>(reader: &mut R, limits: FrameLimits) -> Result<Vec<u8>, Error>
where
    R: AsyncRead + Unpin,
{
    match tokio::time::timeout(limits.timeout, accumulate(reader, limits.max_bytes)).await {
        Ok(result) => result,
        Err(_) => Err(Error::new(ErrorKind::Timeout).with_message(format!(
            "frame not completed within {}ms",
            limits.timeout.as_millis()
        ))),
    }
}

async fn accumulate<R>(reader: &mut R, max_bytes: usize) -> Result<Vec<u8>, Error>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    loop {
        buf.reserve(READ_CHUNK);
        let read = reader.read_buf(&mut buf).await.map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to read frame")
                .with_source(err)
        })?;
        if buf.len() > max_bytes {
            return Err(Error::new(ErrorKind::Malformed)
                .with_message(format!("frame exceeds {max_bytes} bytes")));
        }
        if read == 0 || ends_with_terminator(&buf) {
            return Ok(buf.to_vec());
        }
    }
}

pub fn ends_with_terminator(buf: &[u8]) -> bool {
    buf.ends_with(TERMINATOR.as_bytes())
}
