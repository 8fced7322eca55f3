//! Table objects (§3.2, §4.11.2): an open-addressed, power-of-two sized
//! hash array with cuckoo-style displacement, singly linked chains per
//! bucket.

use std::cell::{Cell, RefCell};
use std::ptr::NonNull;

use kenaf_core::ScriptError;

use crate::heap::{Heap, ObjectHeader, ObjectKind};
use crate::objects::{self};
use crate::value::{bits_equal, Value};

#[derive(Clone, Copy)]
pub struct KvSlot {
    pub key: Value,
    pub value: Value,
    /// Next slot in this bucket's chain; `None` means end-of-chain. A free
    /// slot is represented by `kvslots[i].is_none()` rather than a
    /// sentinel `next` value (§3.2's "`next` is ... null (slot free)").
    pub next: Option<usize>,
}

pub struct TableData {
    pub kvslots: RefCell<Vec<Option<KvSlot>>>,
    pub length: Cell<usize>,
}

fn data(ptr: NonNull<ObjectHeader>) -> &'static TableData {
    unsafe { objects::body::<TableData>(ptr).as_ref() }
}

const INITIAL_CAPACITY: usize = 8;

pub fn new(heap: &Heap, color: u8) -> NonNull<ObjectHeader> {
    heap.alloc(
        ObjectKind::Table,
        color,
        TableData { kvslots: RefCell::new(vec![None; INITIAL_CAPACITY]), length: Cell::new(0) },
    )
}

pub fn length(ptr: NonNull<ObjectHeader>) -> usize {
    data(ptr).length.get()
}

fn hash_value(key: Value) -> Result<u64, ScriptError> {
    if let Some(n) = key.as_number() {
        if n.is_nan() {
            return Err(ScriptError::value("NaN is not a valid table key"));
        }
        return Ok(n.to_bits());
    }
    // Pointer identity (strings are interned, so byte-identical strings
    // share one pointer) gives a stable, cheap hash for every other kind.
    Ok(key.0)
}

fn main_pos(hash: u64, count: usize) -> usize {
    (hash as usize) & (count - 1)
}

/// Find a free slot near `from`, scanning forward then backward (§4.11.2).
fn find_free_near(slots: &[Option<KvSlot>], from: usize) -> Option<usize> {
    let count = slots.len();
    for i in from..count {
        if slots[i].is_none() {
            return Some(i);
        }
    }
    for i in (0..from).rev() {
        if slots[i].is_none() {
            return Some(i);
        }
    }
    None
}

/// Look up `key`'s chain starting at its main position, returning the
/// slot index holding it, if any.
fn find_slot(slots: &[Option<KvSlot>], key: Value, hash: u64) -> Option<usize> {
    let count = slots.len();
    let mut idx = main_pos(hash, count);
    if slots[idx].is_none() {
        return None;
    }
    loop {
        let slot = slots[idx].as_ref().unwrap();
        if bits_equal(slot.key, key) {
            return Some(idx);
        }
        match slot.next {
            Some(n) => idx = n,
            None => return None,
        }
    }
}

pub fn get(ptr: NonNull<ObjectHeader>, key: Value) -> Result<Option<Value>, ScriptError> {
    let t = data(ptr);
    let hash = hash_value(key)?;
    let slots = t.kvslots.borrow();
    Ok(find_slot(&slots, key, hash).map(|i| slots[i].as_ref().unwrap().value))
}

pub fn has(ptr: NonNull<ObjectHeader>, key: Value) -> Result<bool, ScriptError> {
    Ok(get(ptr, key)?.is_some())
}

/// `table_assign` (§3.5): insert-or-update, following the cuckoo
/// displacement algorithm of §4.11.2 on insert.
pub fn assign(heap: &Heap, ptr: NonNull<ObjectHeader>, color: u8, key: Value, value: Value) -> Result<(), ScriptError> {
    let hash = hash_value(key)?;
    let t = data(ptr);

    {
        let mut slots = t.kvslots.borrow_mut();
        if let Some(i) = find_slot(&slots, key, hash) {
            slots[i].as_mut().unwrap().value = value;
            return Ok(());
        }
    }

    if t.length.get() * 2 >= t.kvslots.borrow().len() {
        grow(heap, ptr, color);
    }

    insert_new(t, key, value, hash);
    t.length.set(t.length.get() + 1);
    Ok(())
}

fn insert_new(t: &TableData, key: Value, value: Value, hash: u64) {
    let mut slots = t.kvslots.borrow_mut();
    let count = slots.len();
    let main = main_pos(hash, count);

    if slots[main].is_none() {
        slots[main] = Some(KvSlot { key, value, next: None });
        return;
    }

    let occupant_main = main_pos(hash_value(slots[main].as_ref().unwrap().key).unwrap(), count);
    if occupant_main == main {
        // Occupant belongs here; append the new key to its chain tail.
        let free = find_free_near(&slots, main).expect("table grown before insert");
        let mut tail = main;
        while let Some(next) = slots[tail].as_ref().unwrap().next {
            tail = next;
        }
        slots[tail].as_mut().unwrap().next = Some(free);
        slots[free] = Some(KvSlot { key, value, next: None });
    } else {
        // Occupant is a cuckoo from `occupant_main`'s chain: evict it to a
        // free slot and patch that chain's predecessor link, then claim
        // the main slot for the new key.
        let free = find_free_near(&slots, main).expect("table grown before insert");
        let evicted = slots[main].take().unwrap();

        let mut prev = occupant_main;
        while slots[prev].as_ref().unwrap().next != Some(main) {
            prev = slots[prev].as_ref().unwrap().next.expect("occupant chain must reach main");
        }
        slots[prev].as_mut().unwrap().next = Some(free);
        slots[free] = Some(evicted);

        slots[main] = Some(KvSlot { key, value, next: None });
    }
}

fn grow(heap: &Heap, ptr: NonNull<ObjectHeader>, color: u8) {
    let t = data(ptr);
    let old: Vec<(Value, Value)> = t
        .kvslots
        .borrow()
        .iter()
        .filter_map(|s| s.as_ref().map(|s| (s.key, s.value)))
        .collect();
    let new_count = (t.kvslots.borrow().len() * 2).max(INITIAL_CAPACITY);
    *t.kvslots.borrow_mut() = vec![None; new_count];
    t.length.set(0);
    for (k, v) in old {
        let hash = hash_value(k).unwrap();
        insert_new(t, k, v, hash);
        t.length.set(t.length.get() + 1);
    }
    let _ = heap; // growth never needs a fresh allocation beyond the new Vec
}

/// Delete `key`, promoting the next chain entry into the main slot if the
/// deleted entry was there (§4.11.2).
pub fn delete(ptr: NonNull<ObjectHeader>, key: Value) -> Result<bool, ScriptError> {
    let hash = hash_value(key)?;
    let t = data(ptr);
    let mut slots = t.kvslots.borrow_mut();
    let count = slots.len();
    let main = main_pos(hash, count);
    if slots[main].is_none() {
        return Ok(false);
    }

    if bits_equal(slots[main].as_ref().unwrap().key, key) {
        let next = slots[main].as_ref().unwrap().next;
        slots[main] = next.and_then(|n| slots[n].take());
        drop(slots);
        t.length.set(t.length.get() - 1);
        return Ok(true);
    }

    let mut prev = main;
    loop {
        let next = slots[prev].as_ref().unwrap().next;
        match next {
            Some(n) if bits_equal(slots[n].as_ref().unwrap().key, key) => {
                let after = slots[n].as_ref().unwrap().next;
                slots[n] = None;
                slots[prev].as_mut().unwrap().next = after;
                drop(slots);
                t.length.set(t.length.get() - 1);
                return Ok(true);
            }
            Some(n) => prev = n,
            None => return Ok(false),
        }
    }
}

/// `table_next` (§4.11.2 "iteration"): advance the given slot index
/// (`~i` on the value stack, decoded by the caller) to the next occupied
/// slot, returning `(new_index, key, value)`.
pub fn next(ptr: NonNull<ObjectHeader>, from: usize) -> Option<(usize, Value, Value)> {
    let t = data(ptr);
    let slots = t.kvslots.borrow();
    for i in from..slots.len() {
        if let Some(s) = &slots[i] {
            return Some((i, s.key, s.value));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::Heap;

    #[test]
    fn assign_get_delete_round_trip() {
        let heap = Heap::new();
        let t = new(&heap, 0);
        assign(&heap, t, 0, Value::number(1.0), Value::number(10.0)).unwrap();
        assign(&heap, t, 0, Value::number(2.0), Value::number(20.0)).unwrap();
        assert_eq!(get(t, Value::number(1.0)).unwrap().unwrap().as_number(), Some(10.0));
        assert!(has(t, Value::number(2.0)).unwrap());
        assert!(delete(t, Value::number(1.0)).unwrap());
        assert!(!has(t, Value::number(1.0)).unwrap());
        assert_eq!(length(t), 1);
    }

    #[test]
    fn nan_key_is_a_value_error() {
        let heap = Heap::new();
        let t = new(&heap, 0);
        assert!(assign(&heap, t, 0, Value::number(f64::NAN), Value::null()).is_err());
    }

    #[test]
    fn grows_past_initial_capacity() {
        let heap = Heap::new();
        let t = new(&heap, 0);
        for i in 0..64 {
            assign(&heap, t, 0, Value::number(i as f64), Value::number(i as f64 * 2.0)).unwrap();
        }
        assert_eq!(length(t), 64);
        for i in 0..64 {
            assert_eq!(get(t, Value::number(i as f64)).unwrap().unwrap().as_number(), Some(i as f64 * 2.0));
        }
    }
}
