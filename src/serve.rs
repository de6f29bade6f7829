//! Purpose: Accept RKSOK client connections and run each one as its own task.
//! Exports: `ServeConfig`, `serve`, `serve_with_listener`, `init_tracing`.
//! Role: TCP listener loop; owns the shared record store and authority client.
//! Invariants: Every network read is deadline-bounded; connections never affect each other.
//! Invariants: On shutdown the listener stops accepting and in-flight connections drain for a bounded time.

use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::Instrument;
use tracing_subscriber::EnvFilter;

use crate::connection::Connection;
use crate::core::authority::{AuthorityAddr, ValidationClient};
use crate::core::error::{Error, ErrorKind};
use crate::core::frame::{DEFAULT_MAX_FRAME_BYTES, DEFAULT_TIMEOUT, FrameLimits};
use crate::core::store::{DEFAULT_STORE_DIR, RecordStore};

pub const DEFAULT_PORT: u16 = 8888;
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Clone, Debug)]
pub struct ServeConfig {
    pub bind: SocketAddr,
    pub authority: AuthorityAddr,
    pub store_dir: PathBuf,
    pub client_timeout: Duration,
    pub authority_timeout: Duration,
    pub max_frame_bytes: usize,
}

impl ServeConfig {
    pub fn new(authority: AuthorityAddr) -> Self {
        Self {
            bind: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            authority,
            store_dir: PathBuf::from(DEFAULT_STORE_DIR),
            client_timeout: DEFAULT_TIMEOUT,
            authority_timeout: DEFAULT_TIMEOUT,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }

    fn client_limits(&self) -> FrameLimits {
        FrameLimits {
            timeout: self.client_timeout,
            max_bytes: self.max_frame_bytes,
        }
    }

    fn authority_limits(&self) -> FrameLimits {
        FrameLimits {
            timeout: self.authority_timeout,
            max_bytes: self.max_frame_bytes,
        }
    }
}

pub fn validate_config(config: &ServeConfig) -> Result<(), Error> {
    if config.authority.host.trim().is_empty() {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("authority host must not be empty")
            .with_hint("Pass the validation server host, e.g. vragi-vezde.to.digital."));
    }

    if config.authority.port == 0 {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("authority port must be greater than zero")
            .with_hint("Pass the validation server port, e.g. 51624."));
    }

    if config.client_timeout.is_zero() || config.authority_timeout.is_zero() {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("timeouts must be greater than zero")
            .with_hint("Use a positive value like 5000."));
    }

    if config.max_frame_bytes == 0 {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--max-frame-bytes must be greater than zero")
            .with_hint("Use a positive value like 4194304."));
    }

    Ok(())
}

pub fn init_tracing(ansi: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_ansi(ansi)
        .with_writer(std::io::stderr)
        .try_init();
}

pub async fn serve(config: ServeConfig) -> Result<(), Error> {
    validate_config(&config)?;
    let listener = TcpListener::bind(config.bind).await.map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message(format!("failed to bind {}", config.bind))
            .with_source(err)
    })?;
    serve_with_listener(listener, config, shutdown_signal()).await
}

/// Serves on an already-bound listener until `shutdown` resolves.
pub async fn serve_with_listener<F>(
    listener: TcpListener,
    config: ServeConfig,
    shutdown: F,
) -> Result<(), Error>
where
    F: Future<Output = ()>,
{
    validate_config(&config)?;
    let store = Arc::new(RecordStore::open(&config.store_dir)?);
    let authority = ValidationClient::new(config.authority.clone(), config.authority_limits());
    let limits = config.client_limits();

    match listener.local_addr() {
        Ok(addr) => tracing::info!(
            %addr,
            authority = %config.authority,
            store = %store.root().display(),
            "serving"
        ),
        Err(err) => tracing::warn!(error = %err, "listener address unavailable"),
    }

    let next_id = AtomicU64::new(1);
    let mut connections = JoinSet::new();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        back_off_after_accept_error(&err).await;
                        continue;
                    }
                };
                let id = next_id.fetch_add(1, Ordering::Relaxed);
                let span = tracing::info_span!("conn", id, %peer);
                let connection =
                    Connection::new(stream, limits, authority.clone(), Arc::clone(&store));
                connections.spawn(
                    async move {
                        tracing::info!("start processing request");
                        let response = connection.run().await;
                        tracing::info!(response = response.label(), "connection closed");
                    }
                    .instrument(span),
                );
            }
            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                if let Err(err) = joined {
                    tracing::error!(error = %err, "connection task failed");
                }
            }
            _ = &mut shutdown => {
                tracing::info!(in_flight = connections.len(), "shutting down");
                break;
            }
        }
    }

    drop(listener);
    let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        connections.abort_all();
        return Err(Error::new(ErrorKind::Io).with_message("server shutdown timed out"));
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(unix)]
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    #[cfg(not(unix))]
    ctrl_c.await;
}

// Accept errors such as EMFILE tend to repeat until a connection closes.
async fn back_off_after_accept_error(err: &std::io::Error) {
    tracing::warn!(
        error = %err,
        backoff_ms = ACCEPT_BACKOFF.as_millis() as u64,
        "accept failed"
    );
    tokio::time::sleep(ACCEPT_BACKOFF).await;
}
