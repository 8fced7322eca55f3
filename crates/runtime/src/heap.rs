//! GC object headers and the allocator (§3.2, §4.12.2 "Allocation").
//!
//! Every heap object is a `GcBox<T>` -- a fixed `ObjectHeader` followed by
//! the object's own fields -- allocated with `Box::into_raw` and handed out
//! as an untyped `NonNull<ObjectHeader>` (the pointer `Value::object`/
//! `Value::string` box). Object-specific code in `objects/*` casts that
//! pointer back to `NonNull<GcBox<T>>` once it has checked `header.kind`.
//!
//! `Heap` owns the list of every live allocation so the collector's sweep
//! phase (`gc::Collector::sweep`) can walk it; §5 describes that list as
//! mutator-owned outside of SWEEP and shared via a `heap_mutex` during it.
//! This implementation keeps one `Mutex` around the list at all times
//! rather than eliding it outside SWEEP -- a straightforward simplification
//! of the phase-dependent locking, not a change to what is actually
//! protected.

use std::alloc::Layout as AllocLayout;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;

/// Discriminant stored in every object header, used by the collector to
/// dispatch tracing and by `Value`/`objects::*` to downcast a raw pointer.
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ObjectKind {
    Lookup,
    Layout,
    Array,
    Table,
    Str,
    Function,
    NativeFunction,
    Cothread,
    Program,
    Script,
    /// A captured `vslots` vector (an outenv, §3.2) -- the only object
    /// kind that is just a value-slot vector with no other fields.
    Env,
    /// A boxed `u64` too large for `Value::u64val`'s inline 48-bit payload
    /// (§4.11.4), interned like a string.
    U64Val,
}

pub const FLAG_KEY: u8 = 1 << 0;
pub const FLAG_SEALED: u8 = 1 << 1;

/// `{ color, type, flags, refcount }` (§3.2). `color` is read/written with
/// relaxed atomics per §4.12.4 ("a slightly stale colour read only causes
/// redundant marking, never missed marking"); `refcount` is the external
/// multiset root count from §9, not an intrusive Rust-style refcount --
/// heap-internal references are never counted, only roots held by the host.
#[repr(C)]
pub struct ObjectHeader {
    pub color: AtomicU8,
    pub kind: ObjectKind,
    pub flags: AtomicU8,
    pub refcount: AtomicU8,
}

impl ObjectHeader {
    fn new(kind: ObjectKind, color: u8) -> Self {
        ObjectHeader {
            color: AtomicU8::new(color),
            kind,
            flags: AtomicU8::new(0),
            refcount: AtomicU8::new(0),
        }
    }

    pub fn color(&self) -> u8 {
        self.color.load(Ordering::Relaxed)
    }

    pub fn set_color(&self, color: u8) {
        self.color.store(color, Ordering::Relaxed);
    }

    pub fn flags(&self) -> u8 {
        self.flags.load(Ordering::Relaxed)
    }

    pub fn set_flag(&self, flag: u8) {
        self.flags.fetch_or(flag, Ordering::Relaxed);
    }

    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags() & flag != 0
    }

    /// The external multiset root count a host's `retain`/`release` calls
    /// maintain (§9) -- not an intrusive refcount for heap-internal
    /// references, only for roots the host holds directly.
    pub fn refcount(&self) -> u8 {
        self.refcount.load(Ordering::Relaxed)
    }

    pub fn retain(&self) {
        self.refcount.fetch_add(1, Ordering::Relaxed);
    }

    pub fn release(&self) {
        self.refcount.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| {
            Some(c.saturating_sub(1))
        }).ok();
    }
}

/// Header plus payload, laid out so a `NonNull<GcBox<T>>` and the
/// `NonNull<ObjectHeader>` `Value` carries are the same address.
#[repr(C)]
pub struct GcBox<T> {
    pub header: ObjectHeader,
    pub body: T,
}

/// The allocator and live-object registry. One `Heap` per `VMachine`.
pub struct Heap {
    objects: Mutex<Vec<RawObject>>,
    bytes_allocated: std::sync::atomic::AtomicUsize,
}

/// An untyped live allocation plus the `std::alloc::Layout` it needs to be
/// freed with and a type-erased drop glue function, so `sweep` can drop
/// arbitrary `GcBox<T>`s without the registry being generic over `T`.
struct RawObject {
    ptr: NonNull<ObjectHeader>,
    layout: AllocLayout,
    drop_in_place: unsafe fn(NonNull<ObjectHeader>),
}

unsafe fn drop_gc_box<T>(ptr: NonNull<ObjectHeader>) {
    unsafe {
        std::ptr::drop_in_place(ptr.cast::<GcBox<T>>().as_ptr());
    }
}

impl Heap {
    pub fn new() -> Self {
        Heap { objects: Mutex::new(Vec::new()), bytes_allocated: std::sync::atomic::AtomicUsize::new(0) }
    }

    /// Allocate one GC object, colouring it `color` (the VM's current
    /// `new_color`, per §4.12.2: objects are coloured before any reference
    /// to them is published).
    pub fn alloc<T>(&self, kind: ObjectKind, color: u8, body: T) -> NonNull<ObjectHeader> {
        let boxed = Box::new(GcBox { header: ObjectHeader::new(kind, color), body });
        let layout = AllocLayout::for_value(&*boxed);
        let raw = Box::into_raw(boxed);
        let header_ptr = unsafe { NonNull::new_unchecked(raw as *mut ObjectHeader) };

        self.bytes_allocated.fetch_add(layout.size(), Ordering::Relaxed);
        self.objects.lock().unwrap().push(RawObject {
            ptr: header_ptr,
            layout,
            drop_in_place: drop_gc_box::<T>,
        });
        header_ptr
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated.load(Ordering::Relaxed)
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    /// Sweep phase (§4.12.3): drop every object still coloured `dead_color`,
    /// retaining the rest. Returns the number of objects freed.
    pub fn sweep(&self, dead_color: u8) -> usize {
        let mut objects = self.objects.lock().unwrap();
        let mut freed = 0;
        objects.retain(|obj| {
            if obj.header().color() == dead_color {
                unsafe { (obj.drop_in_place)(obj.ptr) };
                self.bytes_allocated.fetch_sub(obj.layout.size(), Ordering::Relaxed);
                freed += 1;
                false
            } else {
                true
            }
        });
        freed
    }

    /// Call `f` for every live object's header, in allocation order. Used
    /// by the GC thread's root-independent passes and by tests.
    pub fn for_each(&self, mut f: impl FnMut(NonNull<ObjectHeader>)) {
        for obj in self.objects.lock().unwrap().iter() {
            f(obj.ptr);
        }
    }
}

impl RawObject {
    fn header(&self) -> &ObjectHeader {
        unsafe { self.ptr.as_ref() }
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        for obj in self.objects.get_mut().unwrap().drain(..) {
            unsafe { (obj.drop_in_place)(obj.ptr) };
        }
    }
}

// SAFETY: `RawObject` is only ever touched while `Heap::objects`'s mutex is
// held, and the pointee is heap-allocated (not thread-local).
unsafe impl Send for RawObject {}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_tracks_object_count_and_sweep_drops_dead_color() {
        let heap = Heap::new();
        let live = heap.alloc::<u64>(ObjectKind::Str, 1, 0);
        let dead = heap.alloc::<u64>(ObjectKind::Str, 2, 0);
        assert_eq!(heap.object_count(), 2);

        unsafe { dead.as_ref() }.set_color(9);
        let freed = heap.sweep(9);
        assert_eq!(freed, 1);
        assert_eq!(heap.object_count(), 1);
        assert_eq!(unsafe { live.as_ref() }.color(), 1);
    }
}
