// Client for the upstream validation authority ("vragi-vezde").
//
// One round trip per request: connect, send `АМОЖНА? РКСОК/1.0\r\n<request>`,
// read one framed reply, parse its verdict. No retries.
use std::fmt;

use bstr::ByteSlice;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use crate::core::error::{Error, ErrorKind};
use crate::core::frame::{self, FrameLimits};
use crate::core::protocol::{IS_ALLOWED, LINE_DELIMITER, PROTOCOL, Verdict};
use crate::core::request::Request;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AuthorityAddr {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for AuthorityAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Parsed authority reply. `raw` keeps the exact bytes for relaying.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VerdictEnvelope {
    verdict: Verdict,
    raw: Vec<u8>,
}

impl VerdictEnvelope {
    pub fn parse(raw: Vec<u8>) -> Result<Self, Error> {
        let text = std::str::from_utf8(&raw).map_err(|err| {
            Error::new(ErrorKind::MalformedVerdict)
                .with_message("authority reply is not UTF-8")
                .with_source(err)
        })?;
        let verdict = Verdict::from_status_line(text).ok_or_else(|| {
            Error::new(ErrorKind::MalformedVerdict)
                .with_message(format!("unrecognized authority reply: {:?}", raw.as_bstr()))
        })?;
        Ok(Self { verdict, raw })
    }

    pub fn verdict(&self) -> Verdict {
        self.verdict
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn into_raw(self) -> Vec<u8> {
        self.raw
    }
}

pub fn envelope(request: &Request) -> Vec<u8> {
    let mut out = format!("{IS_ALLOWED} {PROTOCOL}{LINE_DELIMITER}").into_bytes();
    out.extend_from_slice(request.raw());
    out
}

#[derive(Clone, Debug)]
pub struct ValidationClient {
    addr: AuthorityAddr,
    limits: FrameLimits,
}

impl ValidationClient {
    pub fn new(addr: AuthorityAddr, limits: FrameLimits) -> Self {
        Self { addr, limits }
    }

    pub fn addr(&self) -> &AuthorityAddr {
        &self.addr
    }

    pub async fn authorize(&self, request: &Request) -> Result<VerdictEnvelope, Error> {
        let timeout = self.limits.timeout;
        let reply = match tokio::time::timeout(timeout, self.round_trip(request)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(Error::new(ErrorKind::Unreachable).with_message(format!(
                    "authority {} did not answer within {}ms",
                    self.addr,
                    timeout.as_millis()
                )));
            }
        };
        if reply.is_empty() {
            return Err(Error::new(ErrorKind::Unreachable)
                .with_message(format!("authority {} closed without a reply", self.addr)));
        }
        tracing::debug!(reply = ?reply.as_bstr(), "authority replied");
        VerdictEnvelope::parse(reply)
    }

    async fn round_trip(&self, request: &Request) -> Result<Vec<u8>, Error> {
        let mut stream = TcpStream::connect((self.addr.host.as_str(), self.addr.port))
            .await
            .map_err(|err| {
                Error::new(ErrorKind::Unreachable)
                    .with_message(format!("cannot connect to authority {}", self.addr))
                    .with_source(err)
            })?;

        let message = envelope(request);
        tracing::debug!(envelope = ?message.as_bstr(), "asking authority");
        stream.write_all(&message).await.map_err(|err| {
            Error::new(ErrorKind::Unreachable)
                .with_message("failed to send request to authority")
                .with_source(err)
        })?;
        stream.flush().await.map_err(|err| {
            Error::new(ErrorKind::Unreachable)
                .with_message("failed to flush request to authority")
                .with_source(err)
        })?;

        frame::read_frame(&mut stream, self.limits)
            .await
            .map_err(|err| match err.kind() {
                ErrorKind::Timeout | ErrorKind::Io => Error::new(ErrorKind::Unreachable)
                    .with_message("failed to read authority reply")
                    .with_source(err),
                _ => err,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::{AuthorityAddr, ValidationClient, VerdictEnvelope, envelope};
    use crate::core::error::ErrorKind;
    use crate::core::frame::{FrameLimits, read_frame};
    use crate::core::protocol::Verdict;
    use crate::core::request::Request;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    fn request() -> Request {
        Request::parse("ОТДОВАЙ Ivan РКСОК/1.0\r\n\r\n".as_bytes()).expect("request")
    }

    fn limits(timeout_ms: u64) -> FrameLimits {
        FrameLimits {
            timeout: Duration::from_millis(timeout_ms),
            ..FrameLimits::default()
        }
    }

    async fn authority_replying(
        reply: &'static [u8],
    ) -> (AuthorityAddr, tokio::task::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            let received = read_frame(&mut socket, FrameLimits::default())
                .await
                .expect("envelope");
            socket.write_all(reply).await.expect("write");
            received
        });
        let addr = AuthorityAddr {
            host: "127.0.0.1".to_string(),
            port,
        };
        (addr, handle)
    }

    #[test]
    fn envelope_prefixes_query_line() {
        assert_eq!(
            envelope(&request()),
            "АМОЖНА? РКСОК/1.0\r\nОТДОВАЙ Ivan РКСОК/1.0\r\n\r\n".as_bytes()
        );
    }

    #[test]
    fn unknown_vocabulary_is_malformed_verdict() {
        let err = VerdictEnvelope::parse(b"MAYBE\r\n\r\n".to_vec()).expect_err("bad");
        assert_eq!(err.kind(), ErrorKind::MalformedVerdict);
        let err = VerdictEnvelope::parse(vec![0xff, 0xfe]).expect_err("bad");
        assert_eq!(err.kind(), ErrorKind::MalformedVerdict);
    }

    #[tokio::test]
    async fn allowed_verdict_round_trip() {
        let (addr, handle) =
            authority_replying("МОЖНА РКСОК/1.0\r\n\r\n".as_bytes()).await;
        let client = ValidationClient::new(addr, limits(2000));
        let verdict = client.authorize(&request()).await.expect("verdict");
        assert_eq!(verdict.verdict(), Verdict::Allowed);
        let received = handle.await.expect("join");
        assert_eq!(received, envelope(&request()));
    }

    #[tokio::test]
    async fn forbidden_verdict_keeps_raw_bytes() {
        let raw = "НИЛЬЗЯ РКСОК/1.0\r\nУже едем\r\n\r\n".as_bytes();
        let (addr, _handle) = authority_replying(raw).await;
        let client = ValidationClient::new(addr, limits(2000));
        let verdict = client.authorize(&request()).await.expect("verdict");
        assert_eq!(verdict.verdict(), Verdict::Forbidden);
        assert_eq!(verdict.raw(), raw);
    }

    #[tokio::test]
    async fn refused_connection_is_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);
        let client = ValidationClient::new(
            AuthorityAddr {
                host: "127.0.0.1".to_string(),
                port,
            },
            limits(2000),
        );
        let err = client.authorize(&request()).await.expect_err("refused");
        assert_eq!(err.kind(), ErrorKind::Unreachable);
    }

    #[tokio::test]
    async fn silent_authority_is_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let _hold = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.expect("accept");
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(socket);
        });
        let client = ValidationClient::new(
            AuthorityAddr {
                host: "127.0.0.1".to_string(),
                port,
            },
            limits(100),
        );
        let err = client.authorize(&request()).await.expect_err("timeout");
        assert_eq!(err.kind(), ErrorKind::Unreachable);
    }
}
