//! The host API (§6.4): what an embedder links against to load a compiled
//! script, register native functions, and drive calls into it. Everything
//! in this module is safe to call between bytecode executions (a
//! safepoint) -- it never itself runs script bytecode except via
//! [`Kenaf::call`].

use kenaf_core::ScriptError;

use crate::execute;
use crate::gc::Phase;
use crate::heap::ObjectKind;
use crate::loader;
use crate::objects::{self, array, function, lookup, table};
use crate::objects::function::{NativeFn, NativeFunctionData};
use crate::value::Value;
use crate::vm::VMachine;

/// An embedding of the runtime: one `VMachine` plus the convenience
/// surface a host actually wants to call. Most of this is a thin
/// pass-through to `objects::*`/`execute::*`, supplying the allocation
/// colour and heap reference those free functions need.
pub struct Kenaf {
    vm: VMachine,
}

impl Kenaf {
    pub fn new() -> Self {
        Kenaf { vm: VMachine::new() }
    }

    pub fn vm(&self) -> &VMachine {
        &self.vm
    }

    /// Load a packed `code_script` blob (§6.1) and return its entry
    /// function as a callable `Value`.
    pub fn load(&self, bytes: &[u8]) -> Result<Value, ScriptError> {
        let color = self.vm.collector.new_color();
        let mut intern = |b: &[u8]| self.vm.intern_string(b);
        let program = loader::load_script(&self.vm.heap, color, &mut intern, bytes)?;
        let function = function::new(&self.vm.heap, color, program, None, 0);
        Ok(Value::object(function))
    }

    /// Register a host function under `name` (§6.4's native function
    /// signature), returning the callable `Value` in case the caller also
    /// wants to attach it to an object rather than (or in addition to) a
    /// global.
    pub fn native_function(&self, name: impl Into<String>, param_count: u32, native_fn: NativeFn) -> Value {
        let color = self.vm.collector.new_color();
        let data = NativeFunctionData { native_fn, cookie: 0, param_count, code_flags: 0, name: name.into() };
        Value::object(function::new_native(&self.vm.heap, color, data))
    }

    /// As [`Kenaf::native_function`], but threads an opaque `cookie`
    /// through to every call (e.g. an index into host-side state the
    /// native function needs, since `NativeFn` is a bare function
    /// pointer with no closure environment).
    pub fn native_function_with_cookie(&self, name: impl Into<String>, param_count: u32, native_fn: NativeFn, cookie: u64) -> Value {
        let color = self.vm.collector.new_color();
        let data = NativeFunctionData { native_fn, cookie, param_count, code_flags: 0, name: name.into() };
        Value::object(function::new_native(&self.vm.heap, color, data))
    }

    pub fn set_global(&self, name: &str, value: Value) {
        let key = self.vm.intern_string(name.as_bytes());
        lookup::lookup_setsel(&self.vm.heap, self.vm.collector.new_color(), &self.vm.tables, self.vm.global, key, value)
            .expect("the global object is never sealed");
    }

    pub fn get_global(&self, name: &str) -> Value {
        let key = self.vm.intern_string(name.as_bytes());
        let mut sel = lookup::Selector::empty();
        lookup::lookup_getsel(self.vm.global, key, &mut sel).unwrap_or(Value::null())
    }

    /// Call a kenaf value with `args`, driving the underlying cothread (and
    /// anything it transitively calls) to completion.
    pub fn call(&self, callee: Value, args: &[Value]) -> Result<Vec<Value>, ScriptError> {
        execute::call_value(&self.vm, callee, args)
    }

    /// Resume a suspended generator cothread. Returns `(values, done)`.
    pub fn resume(&self, cothread: Value, args: &[Value]) -> Result<(Vec<Value>, bool), ScriptError> {
        let co = cothread.as_object().filter(|&o| objects::kind_of(o) == ObjectKind::Cothread).ok_or_else(|| ScriptError::type_error("not a cothread"))?;
        execute::resume_cothread(&self.vm, co, args)
    }

    pub fn new_string(&self, bytes: &[u8]) -> Value {
        Value::string(self.vm.intern_string(bytes))
    }

    pub fn new_array(&self) -> Value {
        Value::object(array::new(&self.vm.heap, self.vm.collector.new_color()))
    }

    pub fn new_table(&self) -> Value {
        Value::object(table::new(&self.vm.heap, self.vm.collector.new_color()))
    }

    /// Create a fresh object, optionally rooted under `prototype`
    /// (§4.1's `new`, called from the host rather than from a script's
    /// `new` expression).
    pub fn new_object(&self, prototype: Option<Value>) -> Result<Value, ScriptError> {
        let proto = match prototype {
            None => None,
            Some(v) => Some(v.as_object().filter(|&o| objects::kind_of(o) == ObjectKind::Lookup).ok_or_else(|| ScriptError::type_error("prototype must be an object"))?),
        };
        let color = self.vm.collector.new_color();
        let layout = lookup::new_root_layout(&self.vm.heap, color, proto, &self.vm.tables);
        Ok(Value::object(lookup::new_lookup(&self.vm.heap, color, layout, 0)))
    }

    pub fn get_key(&self, object: Value, key: &str) -> Result<Value, ScriptError> {
        let obj = object.as_object().filter(|&o| objects::kind_of(o) == ObjectKind::Lookup).ok_or_else(|| ScriptError::type_error("not an object"))?;
        let k = self.vm.intern_string(key.as_bytes());
        let mut sel = lookup::Selector::empty();
        Ok(lookup::lookup_getsel(obj, k, &mut sel).unwrap_or(Value::null()))
    }

    pub fn set_key(&self, object: Value, key: &str, value: Value) -> Result<(), ScriptError> {
        let obj = object.as_object().filter(|&o| objects::kind_of(o) == ObjectKind::Lookup).ok_or_else(|| ScriptError::type_error("not an object"))?;
        let k = self.vm.intern_string(key.as_bytes());
        lookup::lookup_setsel(&self.vm.heap, self.vm.collector.new_color(), &self.vm.tables, obj, k, value)
    }

    /// Seal `object` (§3.2, §4.1): once sealed, its layout chain stops
    /// growing and selectors against it cache an absolute slot index.
    /// Prototypes returned from `new_object` for use as a `new` target
    /// must be sealed for `lookup_setsel`'s sealed/prototype fast path to
    /// apply correctly.
    pub fn seal(&self, object: Value) -> Result<(), ScriptError> {
        let obj = object.as_object().filter(|&o| objects::kind_of(o) == ObjectKind::Lookup).ok_or_else(|| ScriptError::type_error("not an object"))?;
        lookup::seal(obj);
        Ok(())
    }

    /// Hold a strong external root on `value` until [`Kenaf::release`]
    /// (§9's refcount root set) -- for values a host keeps outside of any
    /// cothread's own reachable stack, e.g. a callback stashed in a
    /// `HashMap`.
    pub fn retain(&self, value: Value) {
        self.vm.retain(value);
    }

    pub fn release(&self, value: Value) {
        self.vm.release(value);
    }

    /// Run one step of the collector's safepoint protocol (§4.12.1): kick
    /// off a new mark epoch if enough has been allocated since the last
    /// sweep, mark this VM's roots, and let the collector notice whether
    /// the mark list has drained. Call periodically from host code that
    /// holds the VM idle between script calls; `call`/`resume` do not call
    /// this themselves; Non-goals §1).
    pub fn safepoint(&self) {
        if self.vm.collector.phase() == Phase::None && self.vm.collector.tick_allocation(0) {
            self.vm.collector.begin_mark();
        }
        if self.vm.collector.phase() == Phase::Mark {
            self.vm.mark_roots();
        }
        self.vm.collector.poll(&self.vm.heap);
        if self.vm.collector.phase() == Phase::None {
            self.vm.sweep_interns();
        }
    }

    pub fn heap_bytes(&self) -> usize {
        self.vm.heap.bytes_allocated()
    }

    pub fn object_count(&self) -> usize {
        self.vm.heap.object_count()
    }
}

impl Default for Kenaf {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(_cookie: u64, args: &[Value]) -> Result<Vec<Value>, ScriptError> {
        Ok(args.to_vec())
    }

    #[test]
    fn native_function_round_trips_args() {
        let k = Kenaf::new();
        let f = k.native_function("identity", 1, identity);
        let result = k.call(f, &[Value::number(42.0)]).unwrap();
        assert_eq!(result[0].as_number(), Some(42.0));
    }

    #[test]
    fn global_set_get_round_trips() {
        let k = Kenaf::new();
        k.set_global("answer", Value::number(42.0));
        assert_eq!(k.get_global("answer").as_number(), Some(42.0));
        assert!(k.get_global("missing").is_null());
    }

    #[test]
    fn new_object_chains_to_its_prototype() {
        let k = Kenaf::new();
        let proto = k.new_object(None).unwrap();
        k.set_key(proto, "greeting", k.new_string(b"hi")).unwrap();
        k.seal(proto).unwrap();
        let instance = k.new_object(Some(proto)).unwrap();
        let v = k.get_key(instance, "greeting").unwrap();
        assert!(v.is_string());
    }

    #[test]
    fn array_and_table_allocate_distinct_empty_values() {
        let k = Kenaf::new();
        let a = k.new_array();
        let t = k.new_table();
        assert!(a.is_object());
        assert!(t.is_object());
    }

    fn unused(_cookie: u64, args: &[Value]) -> Result<Vec<Value>, ScriptError> {
        let _ = args;
        Ok(Vec::new())
    }

    #[test]
    fn retain_release_do_not_panic_without_a_gc_cycle() {
        let k = Kenaf::new();
        let f = k.native_function("noop", 0, unused);
        k.retain(f);
        k.safepoint();
        k.release(f);
    }
}
