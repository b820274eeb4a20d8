use colored::*;

use super::object::{
    BoundMethod, Class, Closure, Function, Instance, LoxStr, NativeFn, Object, Upvalue,
};
use super::ptr::Gc;
use super::table::Table;
use super::trace::Traced;
use crate::compiler::compiler::FunctionState;
use crate::debug::{LOG_GC, STRESS_GC};
use crate::vm::{value::Value, CallFrame};

const DEFAULT_NEXT_GC: usize = 1024 * 1024;
const HEAP_GROW_FACTOR: usize = 2;

/// Mark and sweep garbage collector.
///
/// Uses the tri-color abstraction. Objects start out white; the roots (stack,
/// globals, call frames, open upvalues, in-flight compiler state) are marked
/// gray and pushed onto a worklist, every object reachable from a gray object
/// is marked in turn, and whatever is still white afterwards gets swept.
///
/// The GC owns the stacks and tables the VM and compiler operate on, so a
/// collection can reach every root without the mutator registering them.
pub struct GC {
    /// The value stack, shared with the VM.
    pub stack: Vec<Value>,

    /// Global variables, keyed by interned name.
    pub globals: Table,

    /// Call frames of the running program.
    pub call_frames: Vec<CallFrame>,

    /// Per-function compiler states for the compilation in progress, from
    /// the script outwards. Their constants must survive any collection
    /// triggered while compiling.
    pub functions: Vec<FunctionState>,

    /// Upvalues still referring to live stack slots, sorted by ascending
    /// slot index.
    pub open_upvalues: Vec<Gc<Object>>,

    /// The interned `init` string, so constructor lookup never re-interns.
    pub init_string: Option<Gc<Object>>,

    /// Every object the collector owns.
    objects: Vec<Box<Traced<Object>>>,

    /// Intern table. Holds every distinct string exactly once. Weak: not a
    /// root, purged of unmarked keys right before the sweep.
    strings: Table,

    /// Objects marked reachable but not yet scanned for outgoing references.
    gray_list: Vec<Gc<Object>>,

    /// Running total of allocated bytes.
    bytes_allocated: usize,

    /// When `bytes_allocated` passes this threshold the GC collects.
    next_gc: usize,

    /// Collect on every allocation. Used to shake out missing roots.
    pub stress: bool,
}

/// Bytes charged against the allocation total for one object. Only counts payload
/// whose size is fixed at allocation time, so the same amount can be credited
/// back on sweep.
fn heap_size(object: &Object) -> usize {
    let base = std::mem::size_of::<Object>();
    match object {
        Object::String(s) => base + s.len(),
        Object::Closure(c) => base + c.upvalue_count * std::mem::size_of::<Gc<Object>>(),
        _ => base,
    }
}

impl GC {
    pub fn new() -> Self {
        Self {
            stack: Vec::new(),
            globals: Table::new(),
            call_frames: Vec::new(),
            functions: Vec::new(),
            open_upvalues: Vec::new(),
            init_string: None,
            objects: Vec::new(),
            strings: Table::new(),
            gray_list: Vec::new(),
            bytes_allocated: 0,
            next_gc: DEFAULT_NEXT_GC,
            stress: STRESS_GC,
        }
    }

    /// Number of objects currently owned by the collector.
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// Interns a string, returning the canonical object for its contents.
    pub fn track_string(&mut self, string: String) -> Gc<Object> {
        let hash = LoxStr::hash_bytes(string.as_bytes());
        if let Some(interned) = self.strings.find_string(&string, hash) {
            return interned;
        }

        let object = self.allocate(Object::String(LoxStr::new(string, hash)));
        // The intern insert itself cannot trigger a collection, so the fresh
        // string does not need a temporary root here.
        self.strings.set(object, Value::Nil);
        object
    }

    pub fn track_function(&mut self, function: Function) -> Gc<Object> {
        self.allocate(Object::Function(function))
    }

    pub fn track_native(&mut self, native_fn: NativeFn) -> Gc<Object> {
        self.allocate(Object::Native(native_fn))
    }

    pub fn track_closure(&mut self, closure: Closure) -> Gc<Object> {
        self.allocate(Object::Closure(closure))
    }

    pub fn track_upvalue(&mut self, upvalue: Upvalue) -> Gc<Object> {
        self.allocate(Object::Upvalue(upvalue))
    }

    pub fn track_class(&mut self, class: Class) -> Gc<Object> {
        self.allocate(Object::Class(class))
    }

    pub fn track_instance(&mut self, instance: Instance) -> Gc<Object> {
        self.allocate(Object::Instance(instance))
    }

    pub fn track_bound_method(&mut self, bound: BoundMethod) -> Gc<Object> {
        self.allocate(Object::BoundMethod(bound))
    }

    fn allocate(&mut self, object: Object) -> Gc<Object> {
        self.on_track(heap_size(&object));
        self.objects.push(Box::new(Traced::new(object)));
        Gc::new(self.objects.last_mut().unwrap())
    }

    fn on_track(&mut self, allocated: usize) {
        if self.stress {
            self.collect();
        }
        self.bytes_allocated += allocated;
        if self.bytes_allocated > self.next_gc {
            self.collect();
        }
    }

    fn on_sweep(&mut self, deallocated: usize) {
        self.bytes_allocated -= deallocated;
    }

    /// Traces every object reachable from the roots and frees the rest.
    pub fn collect(&mut self) {
        let before = self.bytes_allocated;
        if LOG_GC {
            println!("{}", "[GC]\t\tBEGIN".cyan());
        }

        self.mark_roots();
        self.trace_references();
        // Interning is weak: drop entries whose string did not get marked,
        // then let the sweep free them.
        self.strings.remove_white();
        self.sweep();

        self.next_gc = self.bytes_allocated * HEAP_GROW_FACTOR;

        if LOG_GC {
            println!(
                "{}\t\tCollected {} bytes (from {} to {}) next at {}",
                "[GC]".cyan(),
                before - self.bytes_allocated,
                before,
                self.bytes_allocated,
                self.next_gc
            );
            println!("{}", "[GC]\t\tEND".cyan());
        }
    }

    fn mark_roots(&mut self) {
        let filter_objects = |v: &Value| match v {
            Value::Object(obj) => Some(*obj),
            _ => None,
        };

        // The value stack.
        let stack_objects: Vec<Gc<Object>> =
            self.stack.iter().filter_map(filter_objects).collect();
        self.mark_objects(stack_objects.into_iter());

        // Globals, both names and values.
        let global_objects: Vec<(Gc<Object>, Value)> = self.globals.iter().collect();
        for (key, value) in global_objects {
            self.mark_object(key);
            self.mark_value(value);
        }

        // The compiler chain. Functions being compiled are not heap objects
        // yet, so their names and constants are marked directly; anything
        // those constants reference is found through the gray worklist.
        let mut compiler_objects = Vec::new();
        for state in &self.functions {
            if let Some(name) = state.function.name {
                compiler_objects.push(name);
            }
            for constant in &state.function.chunk.constants {
                if let Some(obj) = filter_objects(constant) {
                    compiler_objects.push(obj);
                }
            }
        }
        self.mark_objects(compiler_objects.into_iter());

        // Closures held by the active call frames.
        let frame_closures: Vec<Gc<Object>> =
            self.call_frames.iter().map(|frame| frame.closure).collect();
        self.mark_objects(frame_closures.into_iter());

        // Open upvalues.
        let open = self.open_upvalues.clone();
        self.mark_objects(open.into_iter());

        if let Some(init_string) = self.init_string {
            self.mark_object(init_string);
        }
    }

    /// Drains the gray worklist, blackening each object and marking
    /// everything it can reach.
    fn trace_references(&mut self) {
        while let Some(object) = self.gray_list.pop() {
            self.blacken(object);
        }
    }

    pub(crate) fn mark_value(&mut self, value: Value) {
        if let Value::Object(object) = value {
            self.mark_object(object);
        }
    }

    fn mark_object(&mut self, object: Gc<Object>) {
        // White objects become gray; a marked object is already gray or
        // black and must not be queued again.
        if !object.marked() {
            if LOG_GC {
                println!("{}\t\tMarking: {}", "[GC]".cyan(), object.as_ref());
            }
            object.set_mark(true);
            self.gray_list.push(object);
        }
    }

    fn mark_objects(&mut self, objects: impl Iterator<Item = Gc<Object>>) {
        objects.for_each(|o| self.mark_object(o));
    }

    /// Scans one gray object's outgoing references.
    fn blacken(&mut self, object: Gc<Object>) {
        if LOG_GC {
            println!("{}\t\tBlacken: {}", "[GC]".cyan(), object.as_ref());
        }
        match object.as_ref() {
            Object::String(_) | Object::Native(_) => {}
            Object::Function(function) => {
                if let Some(name) = function.name {
                    self.mark_object(name);
                }
                for constant in &function.chunk.constants {
                    self.mark_value(*constant);
                }
            }
            Object::Closure(closure) => {
                self.mark_object(closure.function);
                for upvalue in &closure.upvalues {
                    self.mark_object(*upvalue);
                }
            }
            Object::Upvalue(upvalue) => match upvalue {
                Upvalue::Closed(closed) => self.mark_value(*closed),
                Upvalue::Open(_) => {}
            },
            Object::Class(class) => {
                self.mark_object(class.name);
                for (key, value) in class.methods.iter() {
                    self.mark_object(key);
                    self.mark_value(value);
                }
            }
            Object::Instance(instance) => {
                self.mark_object(instance.class);
                for (key, value) in instance.fields.iter() {
                    self.mark_object(key);
                    self.mark_value(value);
                }
            }
            Object::BoundMethod(bound) => {
                self.mark_value(bound.receiver);
                self.mark_object(bound.method);
            }
        }
    }

    /// Frees every object left white and clears the marks of the survivors
    /// for the next cycle.
    fn sweep(&mut self) {
        let mut i = 0;
        while i < self.objects.len() {
            if !self.objects[i].marked() {
                if LOG_GC {
                    println!(
                        "{}\t\t[Sweep object] {}",
                        "[GC]".cyan(),
                        self.objects[i].data
                    );
                }
                let removed = self.objects.swap_remove(i);
                self.on_sweep(heap_size(&removed.data));
                // Do not advance: swap_remove moved the last element here.
            } else {
                self.objects[i].set_mark(false);
                i += 1;
            }
        }
    }
}

impl Default for GC {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_idempotent() {
        let mut gc = GC::new();
        let a = gc.track_string("hello".to_owned());
        let b = gc.track_string("hello".to_owned());
        let c = gc.track_string("world".to_owned());
        assert!(Gc::ptr_eq(&a, &b));
        assert!(!Gc::ptr_eq(&a, &c));
    }

    #[test]
    fn collect_frees_unreachable_objects() {
        let mut gc = GC::new();
        gc.track_string("garbage".to_owned());
        let rooted = gc.track_string("rooted".to_owned());
        gc.stack.push(Value::Object(rooted));

        assert_eq!(gc.object_count(), 2);
        gc.collect();
        assert_eq!(gc.object_count(), 1);

        // The swept string must be gone from the intern table too: interning
        // the same contents again yields a fresh object.
        let again = gc.track_string("rooted".to_owned());
        assert!(Gc::ptr_eq(&again, &rooted));
        assert_eq!(gc.object_count(), 2);
    }

    #[test]
    fn survivors_are_unmarked_after_sweep() {
        let mut gc = GC::new();
        let rooted = gc.track_string("keep".to_owned());
        gc.stack.push(Value::Object(rooted));

        gc.collect();
        assert!(!rooted.marked());
    }

    #[test]
    fn globals_keep_both_name_and_value_alive() {
        let mut gc = GC::new();
        let name = gc.track_string("answer".to_owned());
        let value = gc.track_string("forty-two".to_owned());
        gc.globals.set(name, Value::Object(value));

        gc.collect();
        assert_eq!(gc.object_count(), 2);
    }

    #[test]
    fn closed_upvalue_keeps_its_value_alive() {
        let mut gc = GC::new();
        let payload = gc.track_string("captured".to_owned());
        let mut upvalue = Upvalue::new(0);
        upvalue.close(Value::Object(payload));
        let upvalue = gc.track_upvalue(upvalue);
        gc.stack.push(Value::Object(upvalue));

        gc.collect();
        assert_eq!(gc.object_count(), 2);
    }
}
