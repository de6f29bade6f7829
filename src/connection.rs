//! Purpose: Drive one client connection from first byte to close.
//! Exports: `Connection`, `Stage`, `execute`.
//! Role: Ties frame reading, grammar, authorization and the record store together.
//! Invariants: Exactly one response is written per connection, then the socket is shut down.
//! Invariants: Any stage failure collapses to `Response::Incorrect`; clients never see which stage failed.
//! Invariants: A forbidden verdict is relayed verbatim and the store is never touched.

use std::fmt;
use std::sync::Arc;

use bstr::ByteSlice;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::core::authority::ValidationClient;
use crate::core::error::Error;
use crate::core::frame::{self, FrameLimits};
use crate::core::protocol::{Response, Verb, Verdict};
use crate::core::request::Request;
use crate::core::store::RecordStore;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Stage {
    Receiving,
    Parsing,
    Authorizing,
    Executing,
    Responding,
    Closed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Stage::Receiving => "receiving",
            Stage::Parsing => "parsing",
            Stage::Authorizing => "authorizing",
            Stage::Executing => "executing",
            Stage::Responding => "responding",
            Stage::Closed => "closed",
        };
        f.write_str(label)
    }
}

pub struct Connection<S> {
    stream: S,
    limits: FrameLimits,
    authority: ValidationClient,
    store: Arc<RecordStore>,
    stage: Stage,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        stream: S,
        limits: FrameLimits,
        authority: ValidationClient,
        store: Arc<RecordStore>,
    ) -> Self {
        Self {
            stream,
            limits,
            authority,
            store,
            stage: Stage::Receiving,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Runs the connection to completion and returns the response that was sent.
    pub async fn run(mut self) -> Response {
        let response = match self.process().await {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(stage = %self.stage, error = %err, "request failed");
                Response::Incorrect
            }
        };
        self.enter(Stage::Responding);
        self.respond(&response).await;
        self.enter(Stage::Closed);
        response
    }

    async fn process(&mut self) -> Result<Response, Error> {
        let raw = frame::read_frame(&mut self.stream, self.limits).await?;
        tracing::debug!(request = ?raw.as_bstr(), "received request");

        self.enter(Stage::Parsing);
        let request = Request::parse(&raw)?;

        self.enter(Stage::Authorizing);
        let envelope = self.authority.authorize(&request).await?;
        match envelope.verdict() {
            Verdict::Forbidden => {
                tracing::info!(
                    name = request.name(),
                    verb = ?request.verb(),
                    "authority forbade request"
                );
                Ok(Response::Relayed(envelope.into_raw()))
            }
            Verdict::Allowed => {
                self.enter(Stage::Executing);
                execute(&self.store, request).await
            }
        }
    }

    async fn respond(&mut self, response: &Response) {
        let bytes = response.encode();
        tracing::debug!(response = ?bytes.as_bstr(), kind = response.label(), "sending response");
        if let Err(err) = self.stream.write_all(&bytes).await {
            tracing::warn!(error = %err, "failed to write response");
        } else if let Err(err) = self.stream.flush().await {
            tracing::warn!(error = %err, "failed to flush response");
        }
        if let Err(err) = self.stream.shutdown().await {
            tracing::debug!(error = %err, "failed to shut down connection");
        }
    }

    fn enter(&mut self, stage: Stage) {
        tracing::debug!(from = %self.stage, to = %stage, "stage");
        self.stage = stage;
    }
}

/// Applies an approved request to the store.
pub async fn execute(store: &RecordStore, request: Request) -> Result<Response, Error> {
    match request.verb() {
        Verb::Store => {
            let name = request.name().to_string();
            store.put(&name, &request.into_payload()).await?;
            Ok(Response::Ok(Vec::new()))
        }
        Verb::Retrieve => Ok(match store.get(request.name()).await? {
            Some(phones) => Response::Ok(phones),
            None => Response::NotFound,
        }),
        Verb::Delete => Ok(if store.delete(request.name()).await? {
            Response::Ok(Vec::new())
        } else {
            Response::NotFound
        }),
    }
}
