//! This module contains definition of errors made when reading or rewriting datagrams

use thiserror::Error;

/// Error for datagram reads, writes, and pointer walks
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum WireError {
    /// Ran off the end of the buffer mid-read or mid-write
    #[error("Unexpected end of datagram")]
    UnexpectedEnd,
    /// No pointer marker within the bounded instruction scan
    #[error("No pointer marker found")]
    MissingPtr,
    /// A key that does not belong where it was found
    #[error("Stray key in instruction region")]
    StrayKey,
    /// A pointer walk asked to cross a port or bus hop in a multi-step call
    #[error("Multi-step walk through a link hop")]
    MultiStepLinkHop,
    /// A walk step referenced a sibling, parent, or child that does not exist
    #[error("Walk step leads off the graph")]
    WalkOffGraph,
    /// A walk step needed a bus receive address from a vertex that has none
    #[error("Bus reversal on a vertex without a bus address")]
    NotABus,
    /// Datagram would not fit the segment size or the output buffer
    #[error("Datagram exceeds segment size or buffer")]
    Oversize,
    /// String bytes were not valid UTF-8
    #[error("Malformed string payload")]
    BadString,
}

pub(crate) type WireResult<T> = core::result::Result<T, WireError>;
