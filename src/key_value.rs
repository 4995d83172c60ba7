//! Ordered key/value records on top of a slot-array page. Keys at this
//! layer are already stripped of the node's common prefix; the foster
//! overlay owns that translation.

use crate::record::RecordEncoding;
use crate::slot_array::{block_count, Page, Slot, BLOCK_SIZE};
use crate::util::SmallBuff;
use crate::TruncatedKey;
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertError {
    NoSpace,
    ExistentKey,
}

/// Binary search over the pmnk, then linear disambiguation of the
/// equal-pmnk run by full-key comparison. Returns the slot the key lives
/// in (`true`) or where it would be inserted (`false`).
pub fn lower_bound<E: RecordEncoding>(page: &Page, key: TruncatedKey) -> (usize, bool) {
    let pm = E::pmnk(key.0);
    let slots = page.slots();
    let mut index = slots.partition_point(|s| s.pmnk < pm);
    while index < slots.len() && slots[index].pmnk == pm {
        let stored = E::decode_key(page.payload_tail(slots[index].ptr()), pm);
        match stored.as_slice().cmp(key.0) {
            Ordering::Less => index += 1,
            Ordering::Equal => return (index, true),
            Ordering::Greater => break,
        }
    }
    (index, false)
}

/// Inserts a record, keeping slots sorted. `reserve` blocks are left
/// untouched for the node's special fields.
pub fn insert<E: RecordEncoding>(
    page: &mut Page,
    key: TruncatedKey,
    value: &[u8],
    reserve: usize,
) -> Result<(), InsertError> {
    let (slot_id, found) = lower_bound::<E>(page, key);
    if found {
        return Err(InsertError::ExistentKey);
    }
    let len = E::payload_len(key.0, value);
    if page.free_blocks() < block_count(len) + 1 + reserve {
        return Err(InsertError::NoSpace);
    }
    let ptr = match page.allocate_payload(len) {
        Some(ptr) => ptr,
        None => return Err(InsertError::NoSpace),
    };
    if page.insert_slot(slot_id).is_err() {
        page.free_payload(ptr, len);
        return Err(InsertError::NoSpace);
    }
    E::encode(page.get_payload_mut(ptr, len), key.0, value);
    *page.slot_mut(slot_id) = Slot::new(E::pmnk(key.0), ptr, false);
    Ok(())
}

/// Removes the record for `key`. Returns false when it is absent.
pub fn remove<E: RecordEncoding>(page: &mut Page, key: TruncatedKey) -> bool {
    let (slot_id, found) = lower_bound::<E>(page, key);
    if !found {
        return false;
    }
    let slot = page.get_slot(slot_id);
    let len = E::encoded_len(page.payload_tail(slot.ptr()));
    page.free_payload(slot.ptr(), len);
    page.delete_slot(slot_id);
    true
}

/// Exact match lookup with the branch-descent back-step: on a miss the
/// second component is the greatest slot whose key is below `key`, or
/// `None` when no such slot exists. Branch descent follows that slot's
/// pointer; leaf lookups only trust it when `found` is true.
pub fn find<E: RecordEncoding>(page: &Page, key: TruncatedKey) -> (bool, Option<usize>) {
    let (slot_id, found) = lower_bound::<E>(page, key);
    if found {
        (true, Some(slot_id))
    } else if slot_id == 0 {
        (false, None)
    } else {
        (false, Some(slot_id - 1))
    }
}

pub fn slot_key<E: RecordEncoding>(page: &Page, slot_id: usize) -> SmallBuff {
    let slot = page.get_slot(slot_id);
    E::decode_key(page.payload_tail(slot.ptr()), slot.pmnk)
}

pub fn slot_value<E: RecordEncoding>(page: &Page, slot_id: usize) -> &[u8] {
    E::decode_value(page.payload_tail(page.get_slot(slot_id).ptr()))
}

/// Lazy in-order iteration over a single page.
pub fn iter<'a, E: RecordEncoding>(
    page: &'a Page,
) -> impl Iterator<Item = (SmallBuff, &'a [u8])> + 'a {
    (0..page.slot_count()).map(move |i| (slot_key::<E>(page, i), slot_value::<E>(page, i)))
}

pub fn is_sorted<E: RecordEncoding>(page: &Page) -> bool {
    let mut prev: Option<SmallBuff> = None;
    for i in 0..page.slot_count() {
        let key = slot_key::<E>(page, i);
        if let Some(p) = &prev {
            if p.as_slice() >= key.as_slice() {
                return false;
            }
        }
        prev = Some(key);
    }
    true
}

/// Strips the first `strip` bytes off every stored key, recomputing pmnks
/// and releasing any payload blocks the shorter encodings free. Only
/// sound when all keys share those bytes, i.e. the node's common prefix
/// grew.
pub fn truncate_keys<E: RecordEncoding>(page: &mut Page, strip: usize) {
    for i in 0..page.slot_count() {
        let slot = page.get_slot(i);
        let old_len = E::encoded_len(page.payload_tail(slot.ptr()));
        let key = slot_key::<E>(page, i);
        debug_assert!(key.len() >= strip);
        let value: SmallBuff = SmallBuff::from_slice(slot_value::<E>(page, i));
        let new_key = &key[strip..];
        let new_len = E::payload_len(new_key, &value);
        let old_blocks = block_count(old_len);
        let new_blocks = block_count(new_len);
        debug_assert!(new_blocks <= old_blocks);
        let diff = old_blocks - new_blocks;
        // rebuild at the tail of the old region, then release the leading
        // blocks; free_payload re-targets this slot's pointer
        let new_ptr = slot.ptr() + diff as u16;
        E::encode(page.get_payload_mut(new_ptr, new_len), new_key, &value);
        page.slot_mut(i).pmnk = E::pmnk(new_key);
        if diff > 0 {
            page.free_payload(slot.ptr(), diff * BLOCK_SIZE);
        }
    }
    debug_assert!(is_sorted::<E>(page));
}

/// Moves `count` records starting at `src_from` into `dst` at `dst_at`,
/// succeed-or-nothing. On the first destination failure every record
/// placed so far is rolled back out and the source is untouched; on
/// success the source slots are deleted from the high end downward.
pub fn move_records<E: RecordEncoding>(
    src: &mut Page,
    src_from: usize,
    count: usize,
    dst: &mut Page,
    dst_at: usize,
) -> bool {
    for i in 0..count {
        let slot = src.get_slot(src_from + i);
        let len = E::encoded_len(src.payload_tail(slot.ptr()));
        let placed = match dst.allocate_payload(len) {
            None => false,
            Some(ptr) => {
                if dst.insert_slot(dst_at + i).is_err() {
                    dst.free_payload(ptr, len);
                    false
                } else {
                    dst.get_payload_mut(ptr, len)
                        .copy_from_slice(&src.payload_tail(slot.ptr())[..len]);
                    *dst.slot_mut(dst_at + i) = Slot::new(slot.pmnk, ptr, slot.ghost());
                    true
                }
            }
        };
        if !placed {
            for j in (0..i).rev() {
                let d = dst.get_slot(dst_at + j);
                let dlen = E::encoded_len(dst.payload_tail(d.ptr()));
                dst.free_payload(d.ptr(), dlen);
                dst.delete_slot(dst_at + j);
            }
            return false;
        }
    }
    for i in (src_from..src_from + count).rev() {
        let slot = src.get_slot(i);
        let len = E::encoded_len(src.payload_tail(slot.ptr()));
        src.free_payload(slot.ptr(), len);
        src.delete_slot(i);
    }
    true
}
