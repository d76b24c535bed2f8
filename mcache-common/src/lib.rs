// mcache-common - Wire codec and shared types for the text cache protocol
//
// This crate has no I/O: it builds command frames and decodes reply frames
// out of whatever bytes have arrived so far.

pub mod adapter;
pub mod error;
pub mod protocol;
pub mod types;

// Re-export for convenience
pub use adapter::*;
pub use error::*;
pub use protocol::*;
pub use types::*;
