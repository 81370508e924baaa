// txnest Infrastructure - In-memory Adapter
// Implements: TransactionalResource / PhysicalConnection over a committed map
// with per-connection write overlays

mod store;

pub use store::{MemoryConnection, MemoryStore};
