use crate::foster_node::Node;
use crate::latch::Latch;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

static NODE_IDS: AtomicU64 = AtomicU64::new(1);

/// Process-wide monotone node id.
pub fn next_node_id() -> u64 {
    NODE_IDS.fetch_add(1, Ordering::Relaxed)
}

/// Supplies the raw memory behind nodes. Implementations must be safe to
/// call from concurrent traversals.
pub trait NodeAllocator<L: Latch> {
    /// A fresh leaf node with a fresh id.
    fn allocate(&self) -> NonNull<Node<L>>;

    /// # Safety
    /// `node` must come from this allocator and have no remaining
    /// references.
    unsafe fn deallocate(&self, node: NonNull<Node<L>>);
}

/// Boxes every node on the global heap.
#[derive(Default)]
pub struct HeapAllocator;

impl<L: Latch> NodeAllocator<L> for HeapAllocator {
    fn allocate(&self) -> NonNull<Node<L>> {
        NonNull::new(Box::into_raw(Box::new(Node::new(next_node_id())))).unwrap()
    }

    unsafe fn deallocate(&self, node: NonNull<Node<L>>) {
        drop(Box::from_raw(node.as_ptr()));
    }
}
