//! Stream-oriented client for Backblaze B2.
//!
//! The raw service API is stateless HTTP+JSON and leaves large-file
//! chunking, upload-endpoint churn, token refresh, and retry policy to the
//! caller. This crate hides all of that behind three handles: [`Client`]
//! (one authorized session), [`Bucket`], and [`Object`], whose
//! [`Writer`]/[`Reader`] transfer handles move bytes with a configurable pool
//! of workers and are safe to drive from bulk-copy loops. Cancellation is a
//! [`tokio_util::sync::CancellationToken`] passed at construction; dropping
//! or cancelling it stops every in-flight worker within one round-trip.
//!
//! Wire-level concerns live in the `b2_protocol` crate; everything here is
//! policy and flow.

mod backend;
mod buffer;
mod client;
mod error;
mod raw;
mod reader;
mod status;
mod writer;

#[cfg(test)]
mod testing;

pub use client::{Attrs, Bucket, BucketAttrs, BucketType, Client, Key, Object, ObjectAttrs};
pub use error::Error;
pub use reader::{Reader, ReaderOptions};
pub use status::{StatusSnapshot, TransferProgress};
pub use writer::Writer;
