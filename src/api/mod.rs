//! Purpose: Define the public Rust API boundary for the RKSOK server.
//! Exports: Request/response types, the record store, the authority client, and serve entry points.
//! Role: Single import path for the binary and integration tests.
//! Invariants: Additive-only; internal helpers stay in their modules.

#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::connection::{Connection, Stage};
pub use crate::core::authority::{AuthorityAddr, ValidationClient, VerdictEnvelope};
pub use crate::core::error::{Error, ErrorKind};
pub use crate::core::frame::{FrameLimits, read_frame};
pub use crate::core::protocol::{PROTOCOL, Response, ResponseWord, TERMINATOR, Verb, Verdict};
pub use crate::core::request::Request;
pub use crate::core::store::RecordStore;
pub use crate::serve::{ServeConfig, serve, serve_with_listener};
