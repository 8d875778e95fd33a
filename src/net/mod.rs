//! The network seam every fetch goes through.

mod client;

pub use client::HttpClient;

use async_trait::async_trait;

use crate::error::Result;
use crate::http::{Request, Response};

/// Something that can perform a network fetch.
///
/// An `Err` always means the request never produced a response (offline,
/// timeout, refused connection). HTTP error statuses are returned as `Ok`.
#[async_trait]
pub trait Network: Send + Sync {
  async fn fetch(&self, request: &Request) -> Result<Response>;
}
