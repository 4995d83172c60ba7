//! Node overlay on top of a slot-array page: fence keys, the foster
//! chain, and prefix truncation of stored keys.
//!
//! The five special fields live as payloads at the tail of the page's own
//! heap, behind every user record. Each has a table entry holding its
//! block pointer; resizing one shifts the run of payloads below it and
//! re-targets every field pointer at or below the old position, the
//! field's own included.

use crate::key_value::{self, InsertError};
use crate::latch::Latch;
use crate::log::{EventLog, LogEvent};
use crate::record::RecordEncoding;
use crate::slot_array::{block_count, NoSpace, Page, PayloadPtr, PAGE_BLOCKS};
use crate::util::{common_prefix_len, concat, SmallBuff};
use crate::TruncatedKey;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::mem::size_of;
use std::ptr::NonNull;

/// Blocks of headroom record inserts leave behind, so an overflowing node
/// can always publish a FosterPtr (an empty foster child needs no
/// FosterKey, but the pointer itself takes a block).
const FOSTER_RESERVE: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum FieldTag {
    LowFence = 0,
    HighFence = 1,
    FosterKey = 2,
    FosterPtr = 3,
    Prefix = 4,
}

pub const FIELD_COUNT: usize = 5;

#[derive(Debug, Clone, Copy, Default)]
struct FieldSlot {
    ptr: PayloadPtr,
    len: u16,
    valid: bool,
}

/// A tree node: ordered records plus foster fields, one latch, one page.
/// Level 0 is a leaf; branch values are child node pointers.
pub struct Node<L> {
    id: u64,
    level: u8,
    fields: [FieldSlot; FIELD_COUNT],
    latch: L,
    page: Page,
}

pub fn ptr_value<L>(node: NonNull<Node<L>>) -> [u8; size_of::<usize>()] {
    (node.as_ptr() as usize).to_ne_bytes()
}

impl<L: Latch> Node<L> {
    pub fn new(id: u64) -> Self {
        Node {
            id,
            level: 0,
            fields: Default::default(),
            latch: L::default(),
            page: Page::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn level(&self) -> u8 {
        self.level
    }

    pub fn is_leaf(&self) -> bool {
        self.level == 0
    }

    pub(crate) fn set_level(&mut self, level: u8) {
        self.level = level;
    }

    pub fn latch(&self) -> &L {
        &self.latch
    }

    pub fn page(&self) -> &Page {
        &self.page
    }

    fn field(&self, tag: FieldTag) -> Option<&[u8]> {
        let f = self.fields[tag as usize];
        if f.valid {
            Some(self.page.get_payload(f.ptr, f.len as usize))
        } else {
            None
        }
    }

    pub fn low_fence(&self) -> Option<&[u8]> {
        self.field(FieldTag::LowFence)
    }

    pub fn high_fence(&self) -> Option<&[u8]> {
        self.field(FieldTag::HighFence)
    }

    pub fn foster_key(&self) -> Option<&[u8]> {
        self.field(FieldTag::FosterKey)
    }

    pub fn prefix(&self) -> &[u8] {
        self.field(FieldTag::Prefix).unwrap_or(&[])
    }

    pub fn prefix_len(&self) -> usize {
        let f = self.fields[FieldTag::Prefix as usize];
        if f.valid {
            f.len as usize
        } else {
            0
        }
    }

    pub fn foster_ptr(&self) -> Option<NonNull<Node<L>>> {
        self.field(FieldTag::FosterPtr).map(|bytes| {
            let mut raw = [0u8; size_of::<usize>()];
            raw.copy_from_slice(bytes);
            NonNull::new(usize::from_ne_bytes(raw) as *mut Node<L>).unwrap()
        })
    }

    /// Installs, resizes or clears one of the special fields.
    ///
    /// A new field claims blocks at the very tail, displacing every
    /// existing payload one step toward the head. A resize keeps the
    /// field's end boundary fixed: the run of payloads below its old
    /// start shifts by the block delta and every field pointer at or
    /// below the old start moves with it.
    pub fn set_foster_field(&mut self, tag: FieldTag, new: Option<&[u8]>) -> Result<(), NoSpace> {
        let index = tag as usize;
        let cur = self.fields[index];
        match (cur.valid, new) {
            (false, None) => Ok(()),
            (false, Some(value)) => {
                let ptr = self.page.allocate_end_payload(value.len()).ok_or(NoSpace)?;
                let blocks = block_count(value.len()) as u16;
                for (i, f) in self.fields.iter_mut().enumerate() {
                    if i != index && f.valid {
                        f.ptr -= blocks;
                    }
                }
                self.page
                    .get_payload_mut(ptr, value.len())
                    .copy_from_slice(value);
                self.fields[index] = FieldSlot {
                    ptr,
                    len: value.len() as u16,
                    valid: true,
                };
                Ok(())
            }
            (true, _) => {
                let new_len = new.map_or(0, |v| v.len());
                let old_blocks = block_count(cur.len as usize) as isize;
                let new_blocks = block_count(new_len) as isize;
                let diff = old_blocks - new_blocks;
                if diff != 0 {
                    let begin = self.page.payload_begin();
                    let to = begin as isize + diff;
                    if to < 0 {
                        return Err(NoSpace);
                    }
                    self.page
                        .shift_payloads(to as usize, begin, cur.ptr as usize - begin)?;
                    for f in self.fields.iter_mut() {
                        if f.valid && f.ptr <= cur.ptr {
                            f.ptr = (f.ptr as isize + diff) as PayloadPtr;
                        }
                    }
                }
                match new {
                    Some(value) => {
                        let f = &mut self.fields[index];
                        f.len = value.len() as u16;
                        let ptr = f.ptr;
                        self.page
                            .get_payload_mut(ptr, value.len())
                            .copy_from_slice(value);
                    }
                    None => self.fields[index] = FieldSlot::default(),
                }
                Ok(())
            }
        }
    }

    /// True iff the fences admit `key`; an absent fence is infinite.
    pub fn fence_contains(&self, key: &[u8]) -> bool {
        if let Some(low) = self.low_fence() {
            if key < low {
                return false;
            }
        }
        if let Some(high) = self.high_fence() {
            if key > high {
                return false;
            }
        }
        true
    }

    /// Fence containment minus what has been pushed out to the foster
    /// child.
    pub fn key_range_contains(&self, key: &[u8]) -> bool {
        self.fence_contains(key) && self.foster_key().map_or(true, |fk| key < fk)
    }

    fn truncate<'a>(&self, key: &'a [u8]) -> TruncatedKey<'a> {
        debug_assert!(key.starts_with(self.prefix()));
        TruncatedKey(&key[self.prefix_len()..])
    }

    pub fn insert<E: RecordEncoding, G: EventLog>(
        &mut self,
        key: &[u8],
        value: &[u8],
        log: &G,
    ) -> Result<(), InsertError> {
        let reserve = if self.foster_ptr().is_some() {
            0
        } else {
            FOSTER_RESERVE
        };
        let truncated = self.truncate(key);
        key_value::insert::<E>(&mut self.page, truncated, value, reserve)?;
        log.record(LogEvent::Insert {
            node: self.id,
            key,
            value,
        });
        Ok(())
    }

    /// Removes `key`. With `must_exist` a miss is an error instead of
    /// `false`.
    pub fn remove<E: RecordEncoding, G: EventLog>(
        &mut self,
        key: &[u8],
        must_exist: bool,
        log: &G,
    ) -> Result<bool, crate::tree::TreeError> {
        let truncated = self.truncate(key);
        if key_value::remove::<E>(&mut self.page, truncated) {
            log.record(LogEvent::Remove { node: self.id, key });
            Ok(true)
        } else if must_exist {
            Err(crate::tree::TreeError::KeyNotFound)
        } else {
            Ok(false)
        }
    }

    pub fn lookup<E: RecordEncoding>(&self, key: &[u8]) -> Option<&[u8]> {
        let (found, slot) = key_value::find::<E>(&self.page, self.truncate(key));
        if found {
            Some(key_value::slot_value::<E>(&self.page, slot.unwrap()))
        } else {
            None
        }
    }

    /// Branch descent: the child covering `key`, through the back-step
    /// contract of `find`.
    pub fn child_for<E: RecordEncoding>(&self, key: &[u8]) -> NonNull<Node<L>> {
        debug_assert!(self.level > 0);
        let (_, slot) = key_value::find::<E>(&self.page, self.truncate(key));
        let slot = slot.expect("branch holds a slot at or below every contained key");
        self.child_at::<E>(slot)
    }

    pub fn child_at<E: RecordEncoding>(&self, slot: usize) -> NonNull<Node<L>> {
        let value = key_value::slot_value::<E>(&self.page, slot);
        let mut raw = [0u8; size_of::<usize>()];
        raw.copy_from_slice(value);
        NonNull::new(usize::from_ne_bytes(raw) as *mut Node<L>).unwrap()
    }

    /// In-order records with the node's prefix re-prepended.
    pub fn iter<'a, E: RecordEncoding>(
        &'a self,
    ) -> impl Iterator<Item = (SmallBuff, &'a [u8])> + 'a {
        key_value::iter::<E>(&self.page).map(|(key, value)| (concat(self.prefix(), &key), value))
    }

    /// Grows the stored prefix to the fences' common prefix, stripping
    /// the delta off every record. Skipped when the page cannot hold the
    /// longer Prefix field; the field always describes the truncation
    /// actually applied, so skipping costs compression, never
    /// correctness.
    pub fn update_prefix<E: RecordEncoding>(&mut self) {
        let old = self.prefix_len();
        let common = match (self.low_fence(), self.high_fence()) {
            (Some(low), Some(high)) => common_prefix_len(low, high),
            _ => 0,
        };
        debug_assert!(common >= old);
        if common <= old {
            return;
        }
        let need = block_count(common) - block_count(old);
        if self.page.free_blocks() < need {
            return;
        }
        let prefix = SmallBuff::from_slice(&self.low_fence().unwrap()[..common]);
        key_value::truncate_keys::<E>(&mut self.page, common - old);
        let grown = self.set_foster_field(FieldTag::Prefix, Some(&prefix));
        debug_assert!(grown.is_ok());
    }

    pub fn validate<E: RecordEncoding>(&self) {
        if !cfg!(debug_assertions) {
            return;
        }
        self.page.validate();
        if let (Some(low), Some(high)) = (self.low_fence(), self.high_fence()) {
            assert!(low <= high);
        }
        let mut prev: Option<SmallBuff> = None;
        let mut prev_pmnk = 0u32;
        for i in 0..self.page.slot_count() {
            let slot = self.page.get_slot(i);
            assert!(prev_pmnk <= slot.pmnk);
            prev_pmnk = slot.pmnk;
            let full = concat(self.prefix(), &key_value::slot_key::<E>(&self.page, i));
            if let Some(p) = &prev {
                assert!(p.as_slice() < full.as_slice());
            }
            assert!(self.key_range_contains(&full));
            prev = Some(full);
        }
        for raw in 0..FIELD_COUNT as u8 {
            let tag = FieldTag::try_from(raw).unwrap();
            let f = self.fields[tag as usize];
            if f.valid {
                assert!(f.ptr as usize + block_count(f.len as usize) <= PAGE_BLOCKS);
                assert!(f.ptr as usize >= self.page.payload_begin());
            }
        }
    }
}

/// Attaches `child` as an empty foster child of `parent`, inheriting any
/// existing foster link so the chain extends instead of breaking. The
/// child takes over the parent's high fence and stored prefix; its
/// records arrive with `rebalance`.
pub fn add_foster_child<L: Latch>(
    parent: &mut Node<L>,
    child: &mut Node<L>,
    child_ptr: NonNull<Node<L>>,
) -> Result<(), NoSpace> {
    debug_assert!(child.page.slot_count() == 0);
    child.level = parent.level;
    child.set_foster_field(FieldTag::LowFence, parent.high_fence())?;
    child.set_foster_field(FieldTag::HighFence, parent.high_fence())?;
    child.set_foster_field(FieldTag::Prefix, parent.field(FieldTag::Prefix))?;
    child.set_foster_field(FieldTag::FosterKey, parent.foster_key())?;
    child.set_foster_field(FieldTag::FosterPtr, parent.field(FieldTag::FosterPtr))?;
    parent.set_foster_field(FieldTag::FosterPtr, Some(&ptr_value(child_ptr)))?;
    parent.set_foster_field(FieldTag::FosterKey, None)?;
    Ok(())
}

/// Moves the upper half of `parent`'s records into its (empty) foster
/// child and publishes the split key. Caller holds the write latch.
pub fn rebalance<E: RecordEncoding, L: Latch, G: EventLog>(
    parent: &mut Node<L>,
    child: &mut Node<L>,
    log: &G,
) -> Result<(), NoSpace> {
    let count = parent.page.slot_count();
    debug_assert!(count > 0);
    let split_slot = count / 2;
    let split_key = concat(
        parent.prefix(),
        &key_value::slot_key::<E>(&parent.page, split_slot),
    );
    log.record(LogEvent::Rebalance {
        node: parent.id,
        split_key: &split_key,
    });
    if !key_value::move_records::<E>(
        &mut parent.page,
        split_slot,
        count - split_slot,
        &mut child.page,
        0,
    ) {
        return Err(NoSpace);
    }
    parent.set_foster_field(FieldTag::FosterKey, Some(&split_key))?;
    child.set_foster_field(FieldTag::LowFence, Some(&split_key))?;
    child.set_foster_field(FieldTag::HighFence, parent.high_fence())?;
    child.update_prefix::<E>();
    Ok(())
}

pub fn split<E: RecordEncoding, L: Latch, G: EventLog>(
    node: &mut Node<L>,
    child: &mut Node<L>,
    child_ptr: NonNull<Node<L>>,
    log: &G,
) -> Result<(), NoSpace> {
    add_foster_child(node, child, child_ptr)?;
    rebalance::<E, L, G>(node, child, log)
}
