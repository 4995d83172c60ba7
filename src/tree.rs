//! Tree facade: lock-coupled traversal, opportunistic adoption, and the
//! split-retry loops behind `put`/`get`/`remove`.

use crate::alloc::{HeapAllocator, NodeAllocator};
use crate::foster_node::{ptr_value, split, FieldTag, Node};
use crate::key_value::{slot_key, InsertError};
use crate::latch::{Latch, SpinLatch};
use crate::log::{EventLog, LogEvent, NoLog};
use crate::record::{RecordEncoding, VarRecord};
use crate::slot_array::PAGE_SIZE;
use crate::util::{concat, SmallBuff};
use std::fmt;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeError {
    KeyNotFound,
    ExistentKey,
}

impl fmt::Display for TreeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TreeError::KeyNotFound => write!(f, "key not found"),
            TreeError::ExistentKey => write!(f, "key already exists"),
        }
    }
}

impl std::error::Error for TreeError {}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
    Read,
    Write,
}

fn mode_for(level: u8, for_update: bool) -> Mode {
    if level == 0 && for_update {
        Mode::Write
    } else {
        Mode::Read
    }
}

fn lock<L: Latch>(latch: &L, mode: Mode) {
    match mode {
        Mode::Read => latch.acquire_read(),
        Mode::Write => latch.acquire_write(),
    }
}

fn unlock<L: Latch>(latch: &L, mode: Mode) {
    match mode {
        Mode::Read => latch.release_read(),
        Mode::Write => latch.release_write(),
    }
}

/// Concurrent ordered index over byte-string keys. Interior nodes are
/// only ever latched shared; structural maintenance escalates through
/// latch upgrades and simply skips when it loses the race.
pub struct Tree<
    E: RecordEncoding = VarRecord,
    L: Latch = SpinLatch,
    G: EventLog = NoLog,
    A: NodeAllocator<L> = HeapAllocator,
> {
    root: AtomicPtr<Node<L>>,
    alloc: A,
    log: G,
    adopt: bool,
    _encoding: PhantomData<fn() -> E>,
}

unsafe impl<E, L, G, A> Send for Tree<E, L, G, A>
where
    E: RecordEncoding,
    L: Latch + Send + Sync,
    G: EventLog + Send,
    A: NodeAllocator<L> + Send,
{
}

unsafe impl<E, L, G, A> Sync for Tree<E, L, G, A>
where
    E: RecordEncoding,
    L: Latch + Send + Sync,
    G: EventLog + Sync,
    A: NodeAllocator<L> + Sync,
{
}

impl Tree {
    pub fn new() -> Self {
        Tree::with_parts(HeapAllocator, NoLog)
    }
}

impl Default for Tree {
    fn default() -> Self {
        Tree::new()
    }
}

impl<E, L, G, A> Tree<E, L, G, A>
where
    E: RecordEncoding,
    L: Latch,
    G: EventLog,
    A: NodeAllocator<L>,
{
    pub fn with_parts(alloc: A, log: G) -> Self {
        let tree = Tree {
            root: AtomicPtr::new(std::ptr::null_mut()),
            alloc,
            log,
            adopt: true,
            _encoding: PhantomData,
        };
        let root = tree.new_node(0);
        tree.root.store(root.as_ptr(), Ordering::Release);
        tree
    }

    /// Adoption is opportunistic; turning it off leaves foster chains in
    /// place, which is slower but never incorrect.
    pub fn set_adoption(&mut self, adopt: bool) {
        self.adopt = adopt;
    }

    pub fn root_level(&self) -> u8 {
        unsafe { self.load_root().as_ref() }.level()
    }

    pub(crate) fn load_root(&self) -> NonNull<Node<L>> {
        NonNull::new(self.root.load(Ordering::Acquire)).unwrap()
    }

    fn new_node(&self, level: u8) -> NonNull<Node<L>> {
        let node = self.alloc.allocate();
        unsafe { (*node.as_ptr()).set_level(level) };
        self.log.record(LogEvent::Construct {
            node: unsafe { node.as_ref() }.id(),
        });
        node
    }

    #[tracing::instrument(skip(self, value))]
    pub fn put(&self, key: &[u8], value: &[u8], upsert: bool) -> Result<(), TreeError> {
        assert!(key.len() + value.len() <= PAGE_SIZE / 4);
        let mut leaf = self.traverse(key, true);
        loop {
            let node = unsafe { &mut *leaf.as_ptr() };
            match node.insert::<E, _>(key, value, &self.log) {
                Ok(()) => {
                    node.latch().release_write();
                    return Ok(());
                }
                Err(InsertError::ExistentKey) => {
                    if !upsert {
                        node.latch().release_write();
                        return Err(TreeError::ExistentKey);
                    }
                    let replaced = node.remove::<E, _>(key, true, &self.log);
                    debug_assert!(matches!(replaced, Ok(true)));
                }
                Err(InsertError::NoSpace) => {
                    // publish the overflow as a foster child and retry on
                    // whichever side now owns the key
                    let new = self.new_node(node.level());
                    let new_node = unsafe { &mut *new.as_ptr() };
                    split::<E, L, G>(node, new_node, new, &self.log)
                        .expect("split of a reserved page cannot fail");
                    if !node.key_range_contains(key) {
                        new_node.latch().acquire_write();
                        node.latch().release_write();
                        leaf = new;
                    }
                }
            }
        }
    }

    #[tracing::instrument(skip(self))]
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let leaf = self.traverse(key, false);
        let node = unsafe { leaf.as_ref() };
        let value = node.lookup::<E>(key).map(|v| v.to_vec());
        node.latch().release_read();
        value
    }

    #[tracing::instrument(skip(self))]
    pub fn remove(&self, key: &[u8]) -> bool {
        let leaf = self.traverse(key, true);
        let node = unsafe { &mut *leaf.as_ptr() };
        let removed = node.remove::<E, _>(key, false, &self.log).unwrap_or(false);
        node.latch().release_write();
        removed
    }

    /// Descends to the leaf owning `key`, holding at most two latches at
    /// any moment. Leaves come back write-latched iff `for_update`;
    /// everything above is shared.
    fn traverse(&self, key: &[u8], for_update: bool) -> NonNull<Node<L>> {
        let mut current;
        let mut mode;
        loop {
            current = self.load_root();
            let node = unsafe { current.as_ref() };
            mode = mode_for(node.level(), for_update);
            lock(node.latch(), mode);
            if self.adopt && node.foster_ptr().is_some() && self.grow_root(current) {
                unlock(node.latch(), mode);
                continue;
            }
            break;
        }
        loop {
            if unsafe { current.as_ref() }.level() == 0 {
                break;
            }
            // this level's foster chain
            while !unsafe { current.as_ref() }.key_range_contains(key) {
                let node = unsafe { current.as_ref() };
                let foster = node.foster_ptr().expect("key beyond range of chain tail");
                unsafe { foster.as_ref() }.latch().acquire_read();
                node.latch().release_read();
                current = foster;
            }
            let node = unsafe { current.as_ref() };
            let child = node.child_for::<E>(key);
            let child_mode = mode_for(unsafe { child.as_ref() }.level(), for_update);
            lock(unsafe { child.as_ref() }.latch(), child_mode);
            if self.adopt
                && unsafe { child.as_ref() }.foster_ptr().is_some()
                && self.try_adopt(current, child, child_mode)
            {
                unlock(unsafe { child.as_ref() }.latch(), child_mode);
                continue;
            }
            node.latch().release_read();
            current = child;
            mode = child_mode;
        }
        // the leaf-level foster chain, in the final latch mode
        while !unsafe { current.as_ref() }.key_range_contains(key) {
            let node = unsafe { current.as_ref() };
            let foster = node.foster_ptr().expect("key beyond range of chain tail");
            lock(unsafe { foster.as_ref() }.latch(), mode);
            unlock(node.latch(), mode);
            current = foster;
        }
        current
    }

    /// Moves `child`'s foster child up into `parent`. Both latches are
    /// escalated; failure to escalate skips the adoption, which is always
    /// allowed. On return the traversal latches are back in their
    /// original modes.
    fn try_adopt(&self, parent: NonNull<Node<L>>, child: NonNull<Node<L>>, child_mode: Mode) -> bool {
        let parent_latch = unsafe { parent.as_ref() }.latch();
        let child_latch = unsafe { child.as_ref() }.latch();
        if !parent_latch.attempt_upgrade() {
            return false;
        }
        let upgraded_child = child_mode == Mode::Read;
        if upgraded_child && !child_latch.attempt_upgrade() {
            parent_latch.downgrade();
            return false;
        }
        let child_node = unsafe { &mut *child.as_ptr() };
        let foster = child_node.foster_ptr().expect("adoption needs a foster child");
        let separator = SmallBuff::from_slice(
            child_node
                .foster_key()
                .or(child_node.high_fence())
                .expect("a fostered node bounds its separator"),
        );
        let value = ptr_value(foster);
        let mut target: *mut Node<L> = parent.as_ptr();
        loop {
            let node = unsafe { &mut *target };
            match node.insert::<E, _>(&separator, &value, &self.log) {
                Ok(()) => break,
                Err(InsertError::ExistentKey) => {
                    debug_assert!(false, "separator already present in parent");
                    break;
                }
                Err(InsertError::NoSpace) => {
                    // foster-split the branch and retry on the side that
                    // owns the separator; the new sibling is reachable
                    // only through our write latch
                    let side = self.new_node(node.level());
                    let side_node = unsafe { &mut *side.as_ptr() };
                    if split::<E, L, G>(node, side_node, side, &self.log).is_err() {
                        parent_latch.downgrade();
                        if upgraded_child {
                            child_latch.downgrade();
                        }
                        return false;
                    }
                    if !node.key_range_contains(&separator) {
                        target = side.as_ptr();
                    }
                }
            }
        }
        // dissolve the foster relation and tighten the child's range
        child_node
            .set_foster_field(FieldTag::FosterPtr, None)
            .unwrap();
        child_node
            .set_foster_field(FieldTag::FosterKey, None)
            .unwrap();
        child_node
            .set_foster_field(FieldTag::HighFence, Some(&separator))
            .expect("cleared foster fields cover the tighter fence");
        child_node.update_prefix::<E>();
        parent_latch.downgrade();
        if upgraded_child {
            child_latch.downgrade();
        }
        true
    }

    /// Installs a fresh branch above a fostered root. The old root stays
    /// valid for in-flight traversals; losers of the pointer race free
    /// their candidate and move on.
    fn grow_root(&self, old_root: NonNull<Node<L>>) -> bool {
        let new_root = self.new_node(unsafe { old_root.as_ref() }.level() + 1);
        let node = unsafe { &mut *new_root.as_ptr() };
        node.insert::<E, _>(&[], &ptr_value(old_root), &self.log)
            .expect("fresh root holds one entry");
        if self
            .root
            .compare_exchange(
                old_root.as_ptr(),
                new_root.as_ptr(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            true
        } else {
            unsafe { self.alloc.deallocate(new_root) };
            false
        }
    }

    /// In-order pass over every record, leaf by leaf and along foster
    /// chains. Holds read latches down the visited path, so it is meant
    /// for maintenance and tests rather than the hot path.
    pub fn iterate(&self, mut f: impl FnMut(&[u8], &[u8])) {
        unsafe { self.visit(self.load_root().as_ptr(), &mut f) }
    }

    unsafe fn visit(&self, node: *mut Node<L>, f: &mut impl FnMut(&[u8], &[u8])) {
        let n = &*node;
        n.latch().acquire_read();
        if n.level() == 0 {
            for (key, value) in n.iter::<E>() {
                f(&key, value);
            }
        } else {
            for i in 0..n.page().slot_count() {
                self.visit(n.child_at::<E>(i).as_ptr(), f);
            }
        }
        if let Some(foster) = n.foster_ptr() {
            self.visit(foster.as_ptr(), f);
        }
        n.latch().release_read();
    }

    /// Asserts the structural invariants over the whole tree. Latch-free;
    /// call only on a quiesced tree.
    pub fn validate(&self) {
        unsafe { self.validate_node(self.load_root().as_ptr()) }
    }

    unsafe fn validate_node(&self, node: *mut Node<L>) {
        let n = &*node;
        n.validate::<E>();
        if let Some(foster) = n.foster_ptr() {
            let f = foster.as_ref();
            assert_eq!(f.level(), n.level());
            assert_eq!(f.high_fence(), n.high_fence());
            assert_eq!(f.low_fence(), n.foster_key().or(n.high_fence()));
            self.validate_node(foster.as_ptr());
        }
        if n.level() > 0 {
            for i in 0..n.page().slot_count() {
                let child = n.child_at::<E>(i);
                let c = child.as_ref();
                assert_eq!(c.level() + 1, n.level());
                let separator = concat(n.prefix(), &slot_key::<E>(n.page(), i));
                match c.low_fence() {
                    Some(low) => assert_eq!(low, separator.as_slice()),
                    // the leftmost entry is the empty key standing in for
                    // minus infinity
                    None => assert!(separator.is_empty()),
                }
                self.validate_node(child.as_ptr());
            }
        }
    }

    unsafe fn free_subtree(&self, node: *mut Node<L>) {
        let n = &*node;
        if let Some(foster) = n.foster_ptr() {
            self.free_subtree(foster.as_ptr());
        }
        if n.level() > 0 {
            for i in 0..n.page().slot_count() {
                self.free_subtree(n.child_at::<E>(i).as_ptr());
            }
        }
        self.alloc.deallocate(NonNull::new(node).unwrap());
    }
}

impl<E, L, G, A> Drop for Tree<E, L, G, A>
where
    E: RecordEncoding,
    L: Latch,
    G: EventLog,
    A: NodeAllocator<L>,
{
    fn drop(&mut self) {
        unsafe { self.free_subtree(self.load_root().as_ptr()) }
    }
}
