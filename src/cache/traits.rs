//! Core trait for named cache storage.

use crate::error::Result;
use crate::http::{RequestIdentity, ResponseSnapshot};

/// A set of named cache generations, each mapping request identity to a
/// response snapshot.
///
/// Every operation is atomic per key. Writing an identity that already exists
/// in a generation replaces the previous snapshot.
pub trait CacheStorage: Send + Sync {
  /// Open a generation, creating it if it does not exist.
  fn open(&self, generation: &str) -> Result<()>;

  /// Whether a generation exists.
  fn has(&self, generation: &str) -> Result<bool>;

  /// Names of all generations in creation order.
  fn generations(&self) -> Result<Vec<String>>;

  /// Delete a generation and all of its entries. Returns false if it did not exist.
  fn delete(&self, generation: &str) -> Result<bool>;

  /// Look up an identity in one generation.
  fn match_in(
    &self,
    generation: &str,
    identity: &RequestIdentity,
  ) -> Result<Option<ResponseSnapshot>>;

  /// Look up an identity across every generation, oldest generation first.
  fn match_any(&self, identity: &RequestIdentity) -> Result<Option<ResponseSnapshot>>;

  /// Store a snapshot, creating the generation if needed.
  fn put(
    &self,
    generation: &str,
    identity: &RequestIdentity,
    snapshot: &ResponseSnapshot,
  ) -> Result<()>;

  /// Store several snapshots as one all-or-nothing write.
  fn put_all(&self, generation: &str, entries: &[(RequestIdentity, ResponseSnapshot)])
    -> Result<()>;

  /// Identities stored in a generation, in insertion order.
  fn keys(&self, generation: &str) -> Result<Vec<RequestIdentity>>;
}
