//! This module contains definition of errors surfaced by the fabric.
//!
//! Protocol-level faults (malformed datagrams, bad addresses, capability
//! mismatches) never reach these variants: they release the offending packet
//! and land in the [`ReportSink`][crate::ReportSink]. What is here is
//! structural: graph construction misuse and the fatal loop-property
//! violation.

use thiserror::Error;

/// Error for fabric construction and the tick loop
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum FabricError {
    /// More packets queued in one tick than the loop property allows
    #[error("{queued} packets queued in one tick, loop property violated")]
    LoopOverrun {
        /// Packets collected when the bound tripped
        queued: usize,
    },
    /// A vertex was nested under a parent that already has the maximum
    /// number of children
    #[error("Child limit reached")]
    TooManyChildren,
    /// A vertex id that does not name a vertex in this fabric
    #[error("Unknown vertex")]
    UnknownVertex,
    /// An operation that requires a specific vertex kind was aimed at a
    /// vertex of another kind
    #[error("Vertex is not of the required kind")]
    WrongKind,
    /// An endpoint's route table is full
    #[error("Route table full")]
    RouteTableFull,
    /// A write larger than the endpoint data store
    #[error("Write exceeds the endpoint data bound")]
    OversizeWrite,
    /// A persisted name blob failed its signature or length checks
    #[error("Persisted name blob rejected")]
    BadPersistBlob,
}
