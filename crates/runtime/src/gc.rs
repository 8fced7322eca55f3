//! The concurrent tri-colour mark-sweep collector (§4.12).
//!
//! Two colours alternate epochs as the mutator's "live, not yet re-marked"
//! vs "live, already re-marked" (`old_color`/`new_color`); a third
//! in-between value, [`MARKED`], is the grey state: pushed onto a mark
//! list, not yet traced. The handshake between the mutator thread and the
//! GC thread is exactly the teacher's `scheduler.rs` primitives
//! (`std::sync::{Mutex, Condvar}`, `std::sync::atomic`) repurposed from
//! strand bookkeeping to collector bookkeeping:
//!
//! ```text
//!      mutator                          gc thread
//!    ----------                        -----------
//!    allocate -> colour new_color
//!    write barrier -> push old_color   wait on work_cv
//!      referents onto local mark_list
//!    safepoint: swap local mark_list -> drain popped mark list,
//!      into `work.mark_list`,            trace children, colour
//!      signal work_cv                    MARKED -> new_color (black)
//!                                       when mark lists empty: idle
//!    MARK -> SWEEP once both            wait, then sweep: drop every
//!      mark lists are empty               object still old_color
//! ```

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::heap::{Heap, ObjectHeader};

pub const PURPLE: u8 = 0;
pub const ORANGE: u8 = 1;
pub const MARKED: u8 = 2;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Phase {
    None,
    Mark,
    Sweep,
}

/// Trace the pointer-valued children of one heap object onto `push`.
/// Supplied by `objects::trace_children`, which is type-dispatched on
/// `ObjectHeader::kind`; kept as an indirection here so `gc` does not need
/// to know every concrete object layout.
pub type TraceFn = fn(std::ptr::NonNull<ObjectHeader>, &mut dyn FnMut(std::ptr::NonNull<ObjectHeader>));

struct Shared {
    phase: Mutex<Phase>,
    old_color: AtomicU8,
    new_color: AtomicU8,
    /// Objects the mutator has marked grey but the GC hasn't traced yet.
    mark_list: Mutex<Vec<std::ptr::NonNull<ObjectHeader>>>,
    work_cv: Condvar,
    shutdown: AtomicU8,
    countdown: AtomicUsize,
}

// The GC thread only ever touches `Shared` through `Mutex`/atomics.
unsafe impl Send for Shared {}
unsafe impl Sync for Shared {}

/// One collector instance per VM. `heap` and `trace` are shared (not
/// owned) so the GC thread can run concurrently with the mutator.
pub struct Collector {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

const COUNTDOWN_FLOOR: usize = 512 * 1024;

impl Collector {
    pub fn new(heap: Arc<Heap>, trace: TraceFn) -> Self {
        let shared = Arc::new(Shared {
            phase: Mutex::new(Phase::None),
            old_color: AtomicU8::new(ORANGE),
            new_color: AtomicU8::new(PURPLE),
            mark_list: Mutex::new(Vec::new()),
            work_cv: Condvar::new(),
            shutdown: AtomicU8::new(0),
            countdown: AtomicUsize::new(COUNTDOWN_FLOOR),
        });

        let gc_shared = Arc::clone(&shared);
        let gc_heap = Arc::clone(&heap);
        let thread = std::thread::Builder::new()
            .name("kenaf-gc".into())
            .spawn(move || gc_thread_main(gc_shared, gc_heap, trace))
            .expect("spawn GC thread");

        Collector { shared, thread: Some(thread) }
    }

    pub fn new_color(&self) -> u8 {
        self.shared.new_color.load(Ordering::Relaxed)
    }

    pub fn old_color(&self) -> u8 {
        self.shared.old_color.load(Ordering::Relaxed)
    }

    pub fn phase(&self) -> Phase {
        *self.shared.phase.lock().unwrap()
    }

    /// Allocation-countdown hook: returns true once enough bytes have been
    /// allocated since the last sweep to start a new collection (§4.12.1
    /// SWEEP -> NONE's `countdown` reset).
    pub fn tick_allocation(&self, bytes: usize) -> bool {
        let prev = self.shared.countdown.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| {
            Some(c.saturating_sub(bytes))
        });
        prev.map(|c| c <= bytes).unwrap_or(false)
    }

    /// Write barrier (§4.12.2): call when overwriting a reference slot that
    /// used to hold `overwritten`. If that object is still `old_color`
    /// (white), the mutator marks it grey before the old reference is
    /// lost, preserving the strong tri-colour invariant.
    pub fn write_barrier(&self, overwritten: Option<std::ptr::NonNull<ObjectHeader>>) {
        let Some(ptr) = overwritten else { return };
        if *self.shared.phase.lock().unwrap() != Phase::Mark {
            return;
        }
        let header = unsafe { ptr.as_ref() };
        if header.color() == self.old_color() {
            header.set_color(MARKED);
            self.shared.mark_list.lock().unwrap().push(ptr);
        }
    }

    /// Mark a root object grey at the start of a MARK phase (keys table,
    /// global object, cothread stack, VM-held contexts, §4.12.1).
    pub fn mark_root(&self, ptr: std::ptr::NonNull<ObjectHeader>) {
        let header = unsafe { ptr.as_ref() };
        let old = self.old_color();
        if header.color() == old {
            header.set_color(MARKED);
            self.shared.mark_list.lock().unwrap().push(ptr);
        }
    }

    /// NONE -> MARK: begin a new epoch and wake the GC thread (§4.12.1).
    pub fn begin_mark(&self) {
        let mut phase = self.shared.phase.lock().unwrap();
        if *phase != Phase::None {
            return;
        }
        let old = self.shared.new_color.load(Ordering::Relaxed);
        let new = if old == PURPLE { ORANGE } else { PURPLE };
        self.shared.old_color.store(old, Ordering::Relaxed);
        self.shared.new_color.store(new, Ordering::Relaxed);
        *phase = Phase::Mark;
        self.shared.work_cv.notify_all();
    }

    /// Called at a safepoint. If the mark lists are drained, transitions
    /// MARK -> SWEEP; if already in SWEEP and the GC thread has finished,
    /// transitions SWEEP -> NONE and resets the allocation countdown.
    pub fn poll(&self, heap: &Heap) {
        let mut phase = self.shared.phase.lock().unwrap();
        match *phase {
            Phase::Mark => {
                if self.shared.mark_list.lock().unwrap().is_empty() {
                    *phase = Phase::Sweep;
                    self.shared.work_cv.notify_all();
                }
            }
            Phase::Sweep => {
                // The GC thread itself advances Sweep -> None once it has
                // swept; nothing for the mutator to do here except notice.
                let _ = heap;
            }
            Phase::None => {}
        }
    }

    pub fn shutdown(&mut self) {
        self.shared.shutdown.store(1, Ordering::Relaxed);
        self.shared.work_cv.notify_all();
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

impl Drop for Collector {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn gc_thread_main(shared: Arc<Shared>, heap: Arc<Heap>, trace: TraceFn) {
    loop {
        let mut phase = shared.phase.lock().unwrap();
        loop {
            if shared.shutdown.load(Ordering::Relaxed) != 0 {
                return;
            }
            let work_pending = *phase == Phase::Mark && !shared.mark_list.lock().unwrap().is_empty();
            let sweep_pending = *phase == Phase::Sweep;
            if work_pending || sweep_pending {
                break;
            }
            phase = shared.work_cv.wait(phase).unwrap();
        }
        let current = *phase;
        drop(phase);

        match current {
            Phase::Mark => {
                let batch: Vec<_> = {
                    let mut list = shared.mark_list.lock().unwrap();
                    list.drain(..).collect()
                };
                let new_color = shared.new_color.load(Ordering::Relaxed);
                let old_color = shared.old_color.load(Ordering::Relaxed);
                let mut newly_grey = Vec::new();
                for ptr in batch {
                    trace(ptr, &mut |child| {
                        let header = unsafe { child.as_ref() };
                        if header.color() == old_color {
                            header.set_color(MARKED);
                            newly_grey.push(child);
                        }
                    });
                    unsafe { ptr.as_ref() }.set_color(new_color);
                }
                if !newly_grey.is_empty() {
                    shared.mark_list.lock().unwrap().extend(newly_grey);
                }
            }
            Phase::Sweep => {
                let old_color = shared.old_color.load(Ordering::Relaxed);
                let freed = heap.sweep(old_color);
                tracing::debug!(freed, "gc sweep done");
                shared.countdown.store(
                    (heap.bytes_allocated() / 2).max(COUNTDOWN_FLOOR),
                    Ordering::Relaxed,
                );
                *shared.phase.lock().unwrap() = Phase::None;
            }
            Phase::None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::ObjectKind;

    fn no_children(_: std::ptr::NonNull<ObjectHeader>, _: &mut dyn FnMut(std::ptr::NonNull<ObjectHeader>)) {}

    #[test]
    fn sweep_reclaims_objects_not_reachable_from_roots() {
        let heap = Arc::new(Heap::new());
        let mut gc = Collector::new(Arc::clone(&heap), no_children);

        let garbage = heap.alloc::<u64>(ObjectKind::Str, gc.new_color(), 0);
        let _ = garbage;
        gc.begin_mark();
        // No roots marked: everything allocated before this epoch is dead.
        for _ in 0..50 {
            gc.poll(&heap);
            if gc.phase() == Phase::None {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert_eq!(gc.phase(), Phase::None);
        gc.shutdown();
    }
}
