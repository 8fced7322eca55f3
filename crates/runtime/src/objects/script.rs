//! Script objects (§3.2): `{ name, newlines[] }`, mapping a raw source
//! byte offset (a `sloc`, §4.9's per-op debug table) to `(line, column)`
//! for trace formatting (§7's `"script:line:col: funcname"`).

use std::ptr::NonNull;

use crate::heap::{Heap, ObjectHeader, ObjectKind};
use crate::objects;

pub struct ScriptData {
    pub name: String,
    /// Byte offset of each newline in the original source, ascending.
    pub newlines: Vec<u32>,
}

fn data(ptr: NonNull<ObjectHeader>) -> &'static ScriptData {
    unsafe { objects::body::<ScriptData>(ptr).as_ref() }
}

pub fn new(heap: &Heap, color: u8, name: String, newlines: Vec<u32>) -> NonNull<ObjectHeader> {
    heap.alloc(ObjectKind::Script, color, ScriptData { name, newlines })
}

pub fn name(ptr: NonNull<ObjectHeader>) -> &'static str {
    &data(ptr).name
}

/// 1-based `(line, column)` for a raw source offset, by counting how many
/// newlines precede it.
pub fn line_col(ptr: NonNull<ObjectHeader>, offset: u32) -> (u32, u32) {
    let newlines = &data(ptr).newlines;
    let line_index = newlines.partition_point(|&nl| nl < offset);
    let line = line_index as u32 + 1;
    let col_base = if line_index == 0 { 0 } else { newlines[line_index - 1] + 1 };
    (line, offset - col_base + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::Heap;

    #[test]
    fn line_col_counts_preceding_newlines() {
        let heap = Heap::new();
        // source: "ab\ncd\nef" -- newlines at offsets 2 and 5.
        let s = new(&heap, 0, "t".into(), vec![2, 5]);
        assert_eq!(line_col(s, 0), (1, 1));
        assert_eq!(line_col(s, 3), (2, 1));
        assert_eq!(line_col(s, 7), (3, 2));
    }
}
