//! Shared data primitives for groundwork services.
//!
//! Includes the extended [`Value`] tree and its plain-data representation,
//! time-ordered binary [`Identifier`]s, and merging of downtime windows.

#![warn(missing_docs)]

pub mod downtime;
pub mod id;
pub mod plain;

pub use id::Identifier;
pub use plain::{PlainDataError, Value, from_plain, to_plain};
