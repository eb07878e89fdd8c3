//! Wire codec for the Backblaze B2 v1 API.
//!
//! Every operation is a single HTTP round-trip: plain inputs in, a decoded
//! response struct (or a structured [`ProtocolError`]) out. Retry, backoff,
//! and reauthentication policy live a layer up, in `b2_client`; the only
//! policy this crate owns is the [`error::Action`] classifier that tells that
//! layer what a given failure means.

pub mod constants;
pub mod error;
pub mod http;
pub mod types;

pub use error::{Action, Method, ProtocolError};
pub use http::ProtocolClient;
