//! String objects (§3.2, §4.11.4): `{ size, text[size] }`. Immutable once
//! allocated; keyness (`FLAG_KEY`) is attached lazily by the VM's interning
//! table, not at construction.

use std::ptr::NonNull;

use crate::heap::{Heap, ObjectHeader, ObjectKind};
use crate::objects;

pub struct StringData {
    pub bytes: Box<[u8]>,
    pub hash: u64,
}

fn data(ptr: NonNull<ObjectHeader>) -> &'static StringData {
    unsafe { objects::body::<StringData>(ptr).as_ref() }
}

/// FNV-1a, matching the `(hash, size, bytes)` key the VM's `keys`/string
/// intern tables index by (§3.2, §3.3).
pub fn fnv1a(bytes: &[u8]) -> u64 {
    let mut h: u64 = 0xcbf29ce484222325;
    for &b in bytes {
        h ^= b as u64;
        h = h.wrapping_mul(0x100000001b3);
    }
    h
}

pub fn new(heap: &Heap, color: u8, bytes: &[u8]) -> NonNull<ObjectHeader> {
    heap.alloc(ObjectKind::Str, color, StringData { bytes: bytes.into(), hash: fnv1a(bytes) })
}

pub fn as_bytes(ptr: NonNull<ObjectHeader>) -> &'static [u8] {
    &data(ptr).bytes
}

pub fn hash(ptr: NonNull<ObjectHeader>) -> u64 {
    data(ptr).hash
}

pub fn len(ptr: NonNull<ObjectHeader>) -> usize {
    data(ptr).bytes.len()
}

/// Lexicographic byte compare, shorter-is-less on equal prefix (§4.3).
pub fn compare(a: NonNull<ObjectHeader>, b: NonNull<ObjectHeader>) -> std::cmp::Ordering {
    as_bytes(a).cmp(as_bytes(b))
}

pub fn concat(heap: &Heap, color: u8, a: NonNull<ObjectHeader>, b: NonNull<ObjectHeader>) -> NonNull<ObjectHeader> {
    let mut bytes = Vec::with_capacity(len(a) + len(b));
    bytes.extend_from_slice(as_bytes(a));
    bytes.extend_from_slice(as_bytes(b));
    new(heap, color, &bytes)
}
