//! `VMachine`: the per-interpreter global state (§3.3, §4.12.1's mark roots).
//!
//! One `VMachine` per independent script execution: the heap, the
//! collector, the layout/selector tables, the string/u64val intern
//! tables, the global lookup object, and the stack of suspended parent
//! cothreads that makes up the "cothread stack" §4.10 describes.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::gc::Collector;
use crate::heap::{Heap, ObjectHeader, ObjectKind};
use crate::objects::cothread;
use crate::objects::lookup::{self, LayoutTables, Selector};
use crate::objects::{self, string};
use crate::value::Value;

/// VM-wide intern tables (§3.3, §4.11.1/§4.11.4): every kenaf string used
/// as a table/lookup key is interned once, so key equality is pointer
/// equality; u64vals share the same "lazily created, GC-reclaimed once
/// dead" lifecycle.
#[derive(Default)]
struct Interns {
    strings: HashMap<Box<[u8]>, NonNull<ObjectHeader>>,
    u64vals: HashMap<u64, NonNull<ObjectHeader>>,
}

pub struct VMachine {
    pub heap: Arc<Heap>,
    pub collector: Collector,
    pub tables: LayoutTables,
    interns: RefCell<Interns>,
    /// The root prototype lookup object every bare `{}` object ultimately
    /// chains to (§3.2's "root layout ... sealed against the prototype
    /// lookup object").
    pub root_proto: NonNull<ObjectHeader>,
    pub global: NonNull<ObjectHeader>,
    /// Suspended parent cothreads, most-recently-suspended last (§4.10
    /// "the cothread stack on the VM behaves as a call stack of
    /// cothreads").
    cothread_stack: RefCell<Vec<NonNull<ObjectHeader>>>,
    active: Cell<NonNull<ObjectHeader>>,
    /// Inline cache for `prototype.self`, keyed by prototype address
    /// (§4.10's `call_prototype`).
    self_sel: RefCell<HashMap<usize, Selector>>,
}

fn trace_dispatch(ptr: NonNull<ObjectHeader>, push: &mut dyn FnMut(NonNull<ObjectHeader>)) {
    objects::trace_children(ptr, push)
}

impl VMachine {
    pub fn new() -> Self {
        let heap = Arc::new(Heap::new());
        let collector = Collector::new(Arc::clone(&heap), trace_dispatch);
        let color = collector.new_color();
        let tables = LayoutTables::default();

        let root_proto_layout = lookup::new_root_layout(&heap, color, None, &tables);
        let root_proto = lookup::new_lookup(&heap, color, root_proto_layout, 0);

        let global_layout = lookup::new_root_layout(&heap, color, Some(root_proto), &tables);
        let global = lookup::new_lookup(&heap, color, global_layout, 0);

        let main_cothread = cothread::new(&heap, color);

        VMachine {
            heap,
            collector,
            tables,
            interns: RefCell::new(Interns::default()),
            root_proto,
            global,
            cothread_stack: RefCell::new(Vec::new()),
            active: Cell::new(main_cothread),
            self_sel: RefCell::new(HashMap::new()),
        }
    }

    pub fn active_cothread(&self) -> NonNull<ObjectHeader> {
        self.active.get()
    }

    pub fn set_active_cothread(&self, co: NonNull<ObjectHeader>) {
        self.active.set(co);
    }

    pub fn push_suspended(&self, co: NonNull<ObjectHeader>) {
        self.cothread_stack.borrow_mut().push(co);
    }

    pub fn pop_suspended(&self) -> Option<NonNull<ObjectHeader>> {
        self.cothread_stack.borrow_mut().pop()
    }

    /// Intern `bytes` as a kenaf string (§3.3): same bytes always return
    /// the same heap object, so key comparisons can use pointer equality.
    pub fn intern_string(&self, bytes: &[u8]) -> NonNull<ObjectHeader> {
        if let Some(&existing) = self.interns.borrow().strings.get(bytes) {
            return existing;
        }
        let s = string::new(&self.heap, self.collector.new_color(), bytes);
        self.interns.borrow_mut().strings.insert(bytes.into(), s);
        s
    }

    /// Intern a u64 that doesn't fit `Value::u64val`'s 48-bit inline
    /// payload as a boxed `u64val` object (§4.11.4).
    pub fn intern_u64val(&self, u: u64) -> NonNull<ObjectHeader> {
        if let Some(&existing) = self.interns.borrow().u64vals.get(&u) {
            return existing;
        }
        let boxed = self.heap.alloc(ObjectKind::U64Val, self.collector.new_color(), u);
        self.interns.borrow_mut().u64vals.insert(u, boxed);
        boxed
    }

    pub fn cached_self_selector(&self, prototype: NonNull<ObjectHeader>) -> Selector {
        *self
            .self_sel
            .borrow_mut()
            .entry(prototype.as_ptr() as usize)
            .or_insert_with(Selector::empty)
    }

    pub fn set_self_selector(&self, prototype: NonNull<ObjectHeader>, sel: Selector) {
        self.self_sel.borrow_mut().insert(prototype.as_ptr() as usize, sel);
    }

    /// Mark every GC root (§4.12.1's NONE->MARK step): the global object,
    /// every interned string/u64val (a dead one is simply evicted from
    /// the table by `sweep_interns` once the collector drops it), the
    /// active cothread and every suspended parent, and any object the
    /// host is holding onto via `retain` (`refcount > 0`).
    pub fn mark_roots(&self) {
        self.collector.mark_root(self.root_proto);
        self.collector.mark_root(self.global);
        self.collector.mark_root(self.active.get());
        for &co in self.cothread_stack.borrow().iter() {
            self.collector.mark_root(co);
        }
        for &s in self.interns.borrow().strings.values() {
            self.collector.mark_root(s);
        }
        for &u in self.interns.borrow().u64vals.values() {
            self.collector.mark_root(u);
        }
        self.heap.for_each(|ptr| {
            if unsafe { ptr.as_ref() }.refcount() > 0 {
                self.collector.mark_root(ptr);
            }
        });
    }

    /// Drop intern-table entries whose object the last sweep actually
    /// reclaimed, so the tables don't hold dangling pointers. Call after
    /// `Collector::poll` observes a SWEEP -> NONE transition.
    pub fn sweep_interns(&self) {
        let live = {
            let mut live = std::collections::HashSet::new();
            self.heap.for_each(|ptr| {
                live.insert(ptr.as_ptr() as usize);
            });
            live
        };
        let mut interns = self.interns.borrow_mut();
        interns.strings.retain(|_, v| live.contains(&(v.as_ptr() as usize)));
        interns.u64vals.retain(|_, v| live.contains(&(v.as_ptr() as usize)));
    }

    /// Box a `Value` whose kind requires no heap object: convenience for
    /// host code and native functions that only have a raw number/bool.
    pub fn retain(&self, value: Value) {
        if let Some(ptr) = value.as_object() {
            unsafe { ptr.as_ref() }.retain();
        }
    }

    pub fn release(&self, value: Value) {
        if let Some(ptr) = value.as_object() {
            unsafe { ptr.as_ref() }.release();
        }
    }
}

impl Default for VMachine {
    fn default() -> Self {
        Self::new()
    }
}
