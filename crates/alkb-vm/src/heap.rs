use std::cell::{Cell, RefCell};
use std::mem;

use crate::value::{ClassRef, FieldRef, FuncRef, Instance, ObjBody, ObjData, ObjRef, Value};

/// Heap size that triggers the first collection.
pub const INITIAL_GC_THRESHOLD: usize = 16 * 1024;

/// Garbage-collection statistics.
#[derive(Debug, Default, Clone)]
pub struct GcStats {
    /// Number of collections performed
    pub collections: usize,
    /// Total bytes freed across all cycles
    pub total_bytes_freed: usize,
    /// Total objects freed across all cycles
    pub total_objects_freed: usize,
    /// Bytes freed by the most recent cycle
    pub last_bytes_freed: usize,
    /// Objects freed by the most recent cycle
    pub last_objects_freed: usize,
}

/// The object heap: a bump-free allocator over individual boxes threaded
/// into one intrusive list, collected by non-moving mark-and-sweep.
///
/// The heap does not know what the roots are. `collect` takes a closure
/// that marks them; allocation never collects directly, it only raises a
/// pending flag that the interpreter services at its next safe point.
pub struct Heap {
    head: *mut ObjData,
    bytes_allocated: usize,
    next_gc: usize,
    min_threshold: usize,
    gc_pending: bool,
    stats: GcStats,
}

impl Heap {
    pub fn new() -> Self {
        Self::with_threshold(INITIAL_GC_THRESHOLD)
    }

    pub fn with_threshold(threshold: usize) -> Self {
        Heap {
            head: std::ptr::null_mut(),
            bytes_allocated: 0,
            next_gc: threshold,
            min_threshold: threshold,
            gc_pending: false,
            stats: GcStats::default(),
        }
    }

    pub fn alloc_str(&mut self, s: &str) -> ObjRef {
        // Accounted as header + bytes + trailing terminator, matching
        // the wire format's one-block string layout.
        self.alloc(ObjBody::Str(s.into()), s.len() + 1)
    }

    pub fn alloc_array(&mut self, len: usize) -> ObjRef {
        let elems = vec![Value::Nil; len];
        self.alloc(
            ObjBody::Array(RefCell::new(elems)),
            len * mem::size_of::<Value>(),
        )
    }

    pub fn alloc_instance(&mut self, class_name: ObjRef) -> ObjRef {
        self.alloc(
            ObjBody::Instance(Instance {
                class_name,
                fields: RefCell::new(Vec::new()),
            }),
            0,
        )
    }

    pub fn alloc_funcref(&mut self, name: ObjRef, arity: u32) -> ObjRef {
        self.alloc(ObjBody::FuncRef(FuncRef { name, arity }), 0)
    }

    pub fn alloc_classref(&mut self, name: ObjRef) -> ObjRef {
        self.alloc(ObjBody::ClassRef(ClassRef { name }), 0)
    }

    pub fn alloc_fieldref(&mut self, class_name: ObjRef, field_name: ObjRef) -> ObjRef {
        self.alloc(
            ObjBody::FieldRef(FieldRef {
                class_name,
                field_name,
            }),
            0,
        )
    }

    fn alloc(&mut self, body: ObjBody, extra: usize) -> ObjRef {
        let size = mem::size_of::<ObjData>() + extra;
        let obj = Box::into_raw(Box::new(ObjData {
            marked: Cell::new(false),
            size,
            next: Cell::new(self.head),
            body,
        }));
        self.head = obj;
        self.bytes_allocated += size;
        if self.bytes_allocated >= self.next_gc {
            self.gc_pending = true;
        }
        ObjRef(obj)
    }

    /// True when an allocation has crossed the threshold and a
    /// collection is due at the next safe point.
    pub fn gc_pending(&self) -> bool {
        self.gc_pending
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    pub fn next_gc_threshold(&self) -> usize {
        self.next_gc
    }

    pub fn stats(&self) -> &GcStats {
        &self.stats
    }

    /// Count live objects by walking the heap list.
    pub fn live_objects(&self) -> usize {
        let mut n = 0;
        let mut cur = self.head;
        while !cur.is_null() {
            n += 1;
            cur = unsafe { (*cur).next.get() };
        }
        n
    }

    /// Run one mark-and-sweep cycle. `mark_roots` receives the marker
    /// and must mark every root value.
    pub fn collect<F>(&mut self, mark_roots: F)
    where
        F: FnOnce(&mut Marker),
    {
        self.gc_pending = false;
        let live_before = self.bytes_allocated;

        let mut marker = Marker { gray: Vec::new() };
        mark_roots(&mut marker);
        while let Some(obj) = marker.gray.pop() {
            trace_children(obj, &mut marker);
        }

        let (freed_bytes, freed_objects) = self.sweep();

        self.stats.collections += 1;
        self.stats.total_bytes_freed += freed_bytes;
        self.stats.total_objects_freed += freed_objects;
        self.stats.last_bytes_freed = freed_bytes;
        self.stats.last_objects_freed = freed_objects;

        // Shrink the growth factor when the cycle freed most of the
        // heap, so mostly-garbage workloads collect sooner.
        let grown = if freed_bytes * 2 > live_before {
            self.bytes_allocated + self.bytes_allocated / 2
        } else {
            self.bytes_allocated * 2
        };
        self.next_gc = grown.max(self.min_threshold);

        tracing::debug!(
            freed_bytes,
            freed_objects,
            live_bytes = self.bytes_allocated,
            next_gc = self.next_gc,
            "gc cycle"
        );
    }

    fn sweep(&mut self) -> (usize, usize) {
        let mut freed_bytes = 0;
        let mut freed_objects = 0;

        let mut prev: *mut ObjData = std::ptr::null_mut();
        let mut cur = self.head;
        while !cur.is_null() {
            let obj = unsafe { &*cur };
            let next = obj.next.get();
            if obj.marked.get() {
                obj.marked.set(false);
                prev = cur;
            } else {
                if prev.is_null() {
                    self.head = next;
                } else {
                    unsafe { (*prev).next.set(next) };
                }
                freed_bytes += obj.size;
                freed_objects += 1;
                drop(unsafe { Box::from_raw(cur) });
            }
            cur = next;
        }

        self.bytes_allocated = self.bytes_allocated.saturating_sub(freed_bytes);
        (freed_bytes, freed_objects)
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        let mut cur = self.head;
        while !cur.is_null() {
            let next = unsafe { (*cur).next.get() };
            drop(unsafe { Box::from_raw(cur) });
            cur = next;
        }
        self.head = std::ptr::null_mut();
    }
}

/// Mark-phase work list. Marking is iterative: `mark` greys an object
/// and defers tracing its children to the drain loop in `collect`, so
/// deep object graphs cannot overflow the host stack.
pub struct Marker {
    gray: Vec<ObjRef>,
}

impl Marker {
    pub fn mark_value(&mut self, v: Value) {
        if let Value::Obj(o) = v {
            self.mark(o);
        }
    }

    pub fn mark(&mut self, obj: ObjRef) {
        let data = obj.data();
        if !data.marked.get() {
            data.marked.set(true);
            self.gray.push(obj);
        }
    }
}

fn trace_children(obj: ObjRef, marker: &mut Marker) {
    match obj.body() {
        // Strings hold no outbound references
        ObjBody::Str(_) => {}
        ObjBody::Array(elems) => {
            for &v in elems.borrow().iter() {
                marker.mark_value(v);
            }
        }
        ObjBody::Instance(ins) => {
            marker.mark(ins.class_name);
            for &v in ins.fields.borrow().iter() {
                marker.mark_value(v);
            }
        }
        ObjBody::FuncRef(fr) => marker.mark(fr.name),
        ObjBody::ClassRef(cr) => marker.mark(cr.name),
        ObjBody::FieldRef(fr) => {
            marker.mark(fr.class_name);
            marker.mark(fr.field_name);
        }
    }
}
