//! Call-coalescing primitives for async operations.
//!
//! The main type is [`CoalescingCache`], which deduplicates concurrent invocations
//! of a keyed async operation: every caller that fires a key while an attempt for
//! it is running attaches to that attempt and shares its outcome. Successful
//! outcomes stay cached, failed attempts are evicted so the key can be retried.

#![warn(missing_docs)]

mod coalesce;

pub use coalesce::*;
