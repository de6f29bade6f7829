//! Purpose: Shared harness for end-to-end server tests.
//! Exports: `MockAuthority`, `Behavior`, `TestServer`, `exchange`.
//! Role: Runs an in-process server on loopback against a scripted validation server.
//! Invariants: Every network wait in the harness is bounded.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rksok::api::{AuthorityAddr, FrameLimits, ServeConfig, read_frame, serve_with_listener};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub const ALLOWED: &str = "МОЖНА РКСОК/1.0\r\n\r\n";
pub const FORBIDDEN: &str = "НИЛЬЗЯ РКСОК/1.0\r\n\r\n";
pub const OK: &str = "НОРМАЛДЫКС РКСОК/1.0\r\n\r\n";
pub const NOT_FOUND: &str = "НИНАШОЛ РКСОК/1.0\r\n\r\n";
pub const INCORRECT: &str = "НИПОНЯЛ РКСОК/1.0\r\n\r\n";

#[derive(Clone, Copy, Debug)]
pub enum Behavior {
    Reply(&'static str),
    Silent,
}

pub struct MockAuthority {
    pub addr: AuthorityAddr,
    seen: Arc<Mutex<Vec<Vec<u8>>>>,
    task: JoinHandle<()>,
}

impl MockAuthority {
    pub async fn start(behavior: Behavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind authority");
        let port = listener.local_addr().expect("authority addr").port();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let task_seen = Arc::clone(&seen);
        let task = tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let seen = Arc::clone(&task_seen);
                tokio::spawn(async move {
                    let Ok(envelope) = read_frame(&mut socket, FrameLimits::default()).await else {
                        return;
                    };
                    seen.lock().unwrap_or_else(|p| p.into_inner()).push(envelope);
                    match behavior {
                        Behavior::Reply(reply) => {
                            let _ = socket.write_all(reply.as_bytes()).await;
                            let _ = socket.shutdown().await;
                        }
                        Behavior::Silent => {
                            tokio::time::sleep(Duration::from_secs(30)).await;
                        }
                    }
                });
            }
        });
        Self {
            addr: AuthorityAddr {
                host: "127.0.0.1".to_string(),
                port,
            },
            seen,
            task,
        }
    }

    pub fn envelopes(&self) -> Vec<Vec<u8>> {
        self.seen.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

impl Drop for MockAuthority {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub struct TestServer {
    pub addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<Result<(), rksok::api::Error>>>,
}

impl TestServer {
    pub async fn start(authority: &MockAuthority, store_dir: &Path) -> Self {
        Self::start_with(authority, store_dir, |_| {}).await
    }

    pub async fn start_with(
        authority: &MockAuthority,
        store_dir: &Path,
        adjust: impl FnOnce(&mut ServeConfig),
    ) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind server");
        let addr = listener.local_addr().expect("server addr");
        let mut config = ServeConfig::new(authority.addr.clone());
        config.bind = addr;
        config.store_dir = store_dir.to_path_buf();
        adjust(&mut config);

        let (tx, rx) = oneshot::channel::<()>();
        let task = tokio::spawn(serve_with_listener(listener, config, async move {
            let _ = rx.await;
        }));
        Self {
            addr,
            shutdown: Some(tx),
            task: Some(task),
        }
    }

    pub async fn stop(mut self) -> Result<(), rksok::api::Error> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let task = self.task.take().expect("server task");
        tokio::time::timeout(Duration::from_secs(15), task)
            .await
            .expect("server stops in time")
            .expect("server task joins")
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}

/// Sends one request and reads until the server closes the connection.
pub async fn exchange(addr: SocketAddr, request: &[u8]) -> Vec<u8> {
    tokio::time::timeout(Duration::from_secs(10), async {
        let mut stream = TcpStream::connect(addr).await.expect("connect");
        stream.write_all(request).await.expect("send");
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.expect("receive");
        response
    })
    .await
    .expect("server answers in time")
}

pub async fn exchange_text(addr: SocketAddr, request: &str) -> String {
    String::from_utf8(exchange(addr, request.as_bytes()).await).expect("utf-8 response")
}
