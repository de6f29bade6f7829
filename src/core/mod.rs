// Core modules implementing the wire protocol, record storage, and error modeling.
pub mod authority;
pub mod error;
pub mod frame;
pub mod protocol;
pub mod request;
pub mod store;
