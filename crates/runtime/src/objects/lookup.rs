//! Lookup objects and their layout (hidden-class) chains (§3.2, §4.11.1).
//!
//! A `LookupData` is `{ layout, vslots }`; a `LayoutData` is
//! `{ parent, key, cookie, sindex, next }`. Looking a key up walks the
//! current object's layout chain for an instance slot, then -- on miss --
//! follows the root layout's `parent` up to the prototype and looks there
//! (where the selector caches an absolute slot index instead, since a
//! sealed prototype's slots never move).

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::ptr::NonNull;

use kenaf_core::ScriptError;

use crate::heap::{Heap, ObjectHeader, ObjectKind, FLAG_SEALED};
use crate::objects::{self, VSlots};
use crate::value::Value;

pub struct LookupData {
    pub layout: NonNull<ObjectHeader>,
    pub vslots: VSlots,
}

pub struct LayoutData {
    /// The lookup object this chain's root is sealed against, once this is
    /// the root layout (`key.is_none()`); otherwise the predecessor layout.
    pub parent: Option<NonNull<ObjectHeader>>,
    pub key: Option<NonNull<ObjectHeader>>,
    pub cookie: u32,
    pub sindex: u32,
    /// Cached unique forward successor (the common "keys always added in
    /// the same order" fast path, §3.2).
    pub next: Cell<Option<NonNull<ObjectHeader>>>,
}

/// Where a selector's cached location points: an instance slot index on
/// the object itself, or an absolute slot index on a sealed prototype.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum SelectorSlot {
    Instance { sindex: u32 },
    Prototype { proto: usize, sindex: u32 },
}

/// An inline cache of a key's location (§4.11.1, glossary "selector").
#[derive(Clone, Copy)]
pub struct Selector {
    pub cookie: u32,
    pub slot: SelectorSlot,
}

impl Selector {
    pub const fn empty() -> Self {
        Selector { cookie: 0, slot: SelectorSlot::Instance { sindex: 0 } }
    }
}

/// VM-global tables the layout algorithms consult: the monotonic cookie
/// counter, alternate-successor layouts keyed by `(parent_layout, key)`,
/// and lazily-attached instance layouts keyed by prototype (§4.11.1).
#[derive(Default)]
pub struct LayoutTables {
    next_cookie: Cell<u32>,
    splitkey_layouts: RefCell<HashMap<(usize, usize), NonNull<ObjectHeader>>>,
    instance_layouts: RefCell<HashMap<usize, NonNull<ObjectHeader>>>,
}

// Single-mutator-thread access only; see `objects::mod`'s note on RefCell.
unsafe impl Sync for LayoutTables {}

impl LayoutTables {
    fn mint_cookie(&self) -> u32 {
        let c = self.next_cookie.get() + 1;
        self.next_cookie.set(c);
        c
    }
}

fn key_addr(key: NonNull<ObjectHeader>) -> usize {
    key.as_ptr() as usize
}

fn layout_data(ptr: NonNull<ObjectHeader>) -> &'static LayoutData {
    unsafe { objects::body::<LayoutData>(ptr).as_ref() }
}

fn lookup_data(ptr: NonNull<ObjectHeader>) -> &'static LookupData {
    unsafe { objects::body::<LookupData>(ptr).as_ref() }
}

/// Allocate a fresh root layout for a newly-created lookup object, sealed
/// against `prototype` (the lookup's prototype, or `None` for the bare
/// root prototype).
pub fn new_root_layout(heap: &Heap, color: u8, prototype: Option<NonNull<ObjectHeader>>, tables: &LayoutTables) -> NonNull<ObjectHeader> {
    let data = LayoutData {
        parent: prototype,
        key: None,
        cookie: tables.mint_cookie(),
        sindex: 0,
        next: Cell::new(None),
    };
    heap.alloc(ObjectKind::Layout, color, data)
}

pub fn new_lookup(heap: &Heap, color: u8, layout: NonNull<ObjectHeader>, slot_capacity: usize) -> NonNull<ObjectHeader> {
    heap.alloc(
        ObjectKind::Lookup,
        color,
        LookupData { layout, vslots: VSlots::with_capacity(slot_capacity) },
    )
}

/// `lookup_getsel` (§4.11.1): find `key` on `object`, consulting (and
/// repairing) `sel` as an inline cache.
pub fn lookup_getsel(object: NonNull<ObjectHeader>, key: NonNull<ObjectHeader>, sel: &mut Selector) -> Option<Value> {
    let obj = lookup_data(object);

    if sel.cookie != 0 {
        if let SelectorSlot::Instance { sindex } = sel.slot {
            if layout_data(obj.layout).cookie == sel.cookie {
                return Some(obj.vslots.get(sindex as usize));
            }
        }
    }

    // Walk the instance chain from the current (most-derived) layout node
    // back toward the root via `parent`, which on a non-root node points
    // at its predecessor (only the root's `parent` points at the
    // prototype lookup object).
    let mut node = obj.layout;
    loop {
        let data = layout_data(node);
        match data.key {
            Some(k) if k == key => {
                sel.cookie = layout_data(obj.layout).cookie;
                sel.slot = SelectorSlot::Instance { sindex: data.sindex };
                return Some(obj.vslots.get(data.sindex as usize));
            }
            Some(_) => match data.parent {
                Some(p) => node = p,
                None => break,
            },
            None => break, // reached the root layout with no match
        }
    }

    // Miss on the instance chain: fall through to the prototype, whose
    // layout is sealed and whose slot addresses are therefore stable.
    let Some(proto) = root_prototype(obj.layout) else { return None };
    let proto_data = lookup_data(proto);
    let mut pnode = proto_data.layout;
    loop {
        let data = layout_data(pnode);
        match data.key {
            Some(k) if k == key => {
                sel.cookie = layout_data(proto_data.layout).cookie;
                sel.slot = SelectorSlot::Prototype { proto: proto.as_ptr() as usize, sindex: data.sindex };
                return Some(proto_data.vslots.get(data.sindex as usize));
            }
            Some(_) => match data.parent {
                Some(p) => {
                    pnode = p;
                    continue;
                }
                None => return None,
            },
            None => return None,
        }
    }
}

/// `object`'s own prototype, if any (the lookup object its root layout is
/// sealed against). Used by `SUPER` (§4.1) to resolve a method's defining
/// prototype one step further up the chain.
pub fn prototype_of(object: NonNull<ObjectHeader>) -> Option<NonNull<ObjectHeader>> {
    root_prototype(lookup_data(object).layout)
}

/// Follow a root layout's `parent` to the prototype lookup object, if any.
fn root_prototype(mut layout: NonNull<ObjectHeader>) -> Option<NonNull<ObjectHeader>> {
    loop {
        let data = layout_data(layout);
        match (data.key, data.parent) {
            (None, Some(p)) if objects::kind_of(p) == ObjectKind::Lookup => return Some(p),
            (None, Some(p)) => {
                layout = p;
            }
            (Some(_), Some(p)) => {
                layout = p;
            }
            (_, None) => return None,
        }
    }
}

/// `lookup_setsel` (§4.11.1): assign `key = value` on `object`, creating a
/// new layout node when the key is new.
pub fn lookup_setsel(
    heap: &Heap,
    color: u8,
    tables: &LayoutTables,
    object: NonNull<ObjectHeader>,
    key: NonNull<ObjectHeader>,
    value: Value,
) -> Result<(), ScriptError> {
    let obj = lookup_data(object);
    let header = unsafe { object.as_ref() };

    // Already-present key: just overwrite its slot.
    let mut sel = Selector::empty();
    if lookup_getsel(object, key, &mut sel).is_some() {
        if let SelectorSlot::Instance { sindex } = sel.slot {
            obj.vslots.set(sindex as usize, value);
            return Ok(());
        }
    }

    if header.has_flag(FLAG_SEALED) {
        return Err(ScriptError::key("cannot add a new key to a sealed object"));
    }

    let current = layout_data(obj.layout);
    let new_sindex = current.sindex + 1;

    let next_layout = if let Some(cached) = current.next.get() {
        if layout_data(cached).key == Some(key) {
            Some(cached)
        } else {
            None
        }
    } else {
        None
    };

    let new_layout = match next_layout {
        Some(l) => l,
        None => {
            let split_key = (obj.layout.as_ptr() as usize, key_addr(key));
            if let Some(&existing) = tables.splitkey_layouts.borrow().get(&split_key) {
                existing
            } else {
                let created = heap.alloc(
                    ObjectKind::Layout,
                    color,
                    LayoutData {
                        parent: Some(obj.layout),
                        key: Some(key),
                        cookie: tables.mint_cookie(),
                        sindex: new_sindex,
                        next: Cell::new(None),
                    },
                );
                if current.next.get().is_none() {
                    current.next.set(Some(created));
                } else {
                    tables.splitkey_layouts.borrow_mut().insert(split_key, created);
                }
                created
            }
        }
    };

    obj.vslots.grow_to(new_sindex as usize + 1);
    obj.vslots.set(new_sindex as usize, value);
    // SAFETY: `layout` is the only field mutated on an otherwise-immutable
    // `LookupData`; writes are confined to the single mutator thread.
    unsafe {
        let p = objects::body::<LookupData>(object).as_ptr();
        std::ptr::write(std::ptr::addr_of_mut!((*p).layout), new_layout);
    }
    Ok(())
}

pub fn has_key(object: NonNull<ObjectHeader>, key: NonNull<ObjectHeader>) -> bool {
    let mut sel = Selector::empty();
    lookup_getsel(object, key, &mut sel).is_some()
}

pub fn seal(object: NonNull<ObjectHeader>) {
    unsafe { object.as_ref() }.set_flag(FLAG_SEALED);
}

pub fn is_sealed(object: NonNull<ObjectHeader>) -> bool {
    unsafe { object.as_ref() }.has_flag(FLAG_SEALED)
}
