//! The per-note CRDT document: in-memory state ([`DocumentSnapshot`]) and
//! the durable per-instance sync position it carries ([`VectorClock`]).

mod document_snapshot;
mod vector_clock;

pub use document_snapshot::DocumentSnapshot;
pub use vector_clock::{ClockEntry, VectorClock};
