//! Array objects (§3.2, §4.11.3): `{ aslots, length }` over a value-slot
//! vector whose capacity may exceed `length`.

use std::cell::Cell;
use std::ptr::NonNull;

use kenaf_core::ScriptError;

use crate::heap::{Heap, ObjectHeader, ObjectKind};
use crate::objects::{self, VSlots};
use crate::value::Value;

pub struct ArrayData {
    pub aslots: VSlots,
    pub length: Cell<usize>,
}

fn data(ptr: NonNull<ObjectHeader>) -> &'static ArrayData {
    unsafe { objects::body::<ArrayData>(ptr).as_ref() }
}

pub fn new(heap: &Heap, color: u8) -> NonNull<ObjectHeader> {
    heap.alloc(ObjectKind::Array, color, ArrayData { aslots: VSlots::default(), length: Cell::new(0) })
}

pub fn length(ptr: NonNull<ObjectHeader>) -> usize {
    data(ptr).length.get()
}

/// §4.11.3's growth factor: doubling below 512 elements, 1.5x above.
fn grown_capacity(prior: usize) -> usize {
    if prior > 512 {
        prior * 2 - prior / 4
    } else {
        (prior * 2).max(8)
    }
}

fn ensure_capacity(a: &ArrayData, min: usize) {
    if a.aslots.len() < min {
        let target = grown_capacity(a.aslots.len()).max(min);
        a.aslots.grow_to(target);
    }
}

pub fn get_index(ptr: NonNull<ObjectHeader>, index: i64) -> Result<Value, ScriptError> {
    let a = data(ptr);
    let len = a.length.get();
    if index < 0 || index as usize >= len {
        return Err(ScriptError::index(format!("array index {index} out of range (length {len})")));
    }
    Ok(a.aslots.get(index as usize))
}

pub fn set_index(ptr: NonNull<ObjectHeader>, index: i64, value: Value) -> Result<(), ScriptError> {
    let a = data(ptr);
    let len = a.length.get();
    if index < 0 || index as usize >= len {
        return Err(ScriptError::index(format!("array index {index} out of range (length {len})")));
    }
    a.aslots.set(index as usize, value);
    Ok(())
}

pub fn append(ptr: NonNull<ObjectHeader>, value: Value) {
    let a = data(ptr);
    let len = a.length.get();
    ensure_capacity(a, len + 1);
    a.aslots.set(len, value);
    a.length.set(len + 1);
}

pub fn extend(ptr: NonNull<ObjectHeader>, values: &[Value]) {
    let a = data(ptr);
    let len = a.length.get();
    ensure_capacity(a, len + values.len());
    for (i, v) in values.iter().enumerate() {
        a.aslots.set(len + i, *v);
    }
    a.length.set(len + values.len());
}

pub fn insert(ptr: NonNull<ObjectHeader>, index: usize, value: Value) -> Result<(), ScriptError> {
    let a = data(ptr);
    let len = a.length.get();
    if index > len {
        return Err(ScriptError::index(format!("insert index {index} out of range (length {len})")));
    }
    ensure_capacity(a, len + 1);
    for i in (index..len).rev() {
        let v = a.aslots.get(i);
        a.aslots.set(i + 1, v);
    }
    a.aslots.set(index, value);
    a.length.set(len + 1);
    Ok(())
}

pub fn remove(ptr: NonNull<ObjectHeader>, index: usize) -> Result<Value, ScriptError> {
    let a = data(ptr);
    let len = a.length.get();
    if index >= len {
        return Err(ScriptError::index(format!("remove index {index} out of range (length {len})")));
    }
    let removed = a.aslots.get(index);
    for i in index..len - 1 {
        let v = a.aslots.get(i + 1);
        a.aslots.set(i, v);
    }
    a.aslots.set(len - 1, Value::null());
    a.length.set(len - 1);
    Ok(removed)
}

pub fn clear(ptr: NonNull<ObjectHeader>) {
    let a = data(ptr);
    for i in 0..a.length.get() {
        a.aslots.set(i, Value::null());
    }
    a.length.set(0);
}

pub fn pop(ptr: NonNull<ObjectHeader>) -> Result<Value, ScriptError> {
    let a = data(ptr);
    let len = a.length.get();
    if len == 0 {
        return Err(ScriptError::index("pop from an empty array"));
    }
    remove(ptr, len - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::Heap;

    #[test]
    fn append_and_index_round_trip() {
        let heap = Heap::new();
        let a = new(&heap, 0);
        append(a, Value::number(1.0));
        append(a, Value::number(2.0));
        assert_eq!(length(a), 2);
        assert_eq!(get_index(a, 0).unwrap().as_number(), Some(1.0));
        assert_eq!(get_index(a, 1).unwrap().as_number(), Some(2.0));
        assert!(get_index(a, 2).is_err());
    }

    #[test]
    fn remove_shifts_subsequent_elements() {
        let heap = Heap::new();
        let a = new(&heap, 0);
        for n in [1.0, 2.0, 3.0] {
            append(a, Value::number(n));
        }
        let removed = remove(a, 0).unwrap();
        assert_eq!(removed.as_number(), Some(1.0));
        assert_eq!(length(a), 2);
        assert_eq!(get_index(a, 0).unwrap().as_number(), Some(2.0));
    }
}
