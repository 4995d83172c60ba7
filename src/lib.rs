//! A concurrent, in-memory, ordered key-value index organized as a
//! Foster B-tree: a node that overflows publishes the overflow as a
//! same-level foster child, and a later traversal opportunistically
//! adopts the child into the parent. The heavy record redistribution and
//! the light parent update never happen under the same latches.

use std::ops::Deref;

pub mod alloc;
pub mod foster_node;
pub mod key_value;
pub mod latch;
pub mod log;
pub mod record;
pub mod slot_array;
pub mod tree;
pub mod util;

#[cfg(test)]
mod tests;

pub use tree::{Tree, TreeError};

/// A key with its node's stored common prefix already removed. The
/// key-value layer only ever sees these; the foster overlay strips and
/// re-prepends at the public boundary.
#[derive(Ord, PartialOrd, Eq, PartialEq, Copy, Clone, Debug)]
pub struct TruncatedKey<'a>(pub &'a [u8]);

impl Deref for TruncatedKey<'_> {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.0
    }
}
