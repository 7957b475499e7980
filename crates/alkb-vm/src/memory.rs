use crate::error::VmError;
use crate::heap::Marker;
use crate::value::Value;

/// Capacity of the value stack, reserved up front.
///
/// The JIT caches the base address of the current register window for
/// the duration of an emitted region, so the backing storage must never
/// move; pushing past this capacity is a runtime error instead.
pub const VALUE_STACK_CAPACITY: usize = 64 * 1024;

/// One activation record. Registers live in the shared value stack at
/// `base .. base + reg_count`.
#[derive(Debug, Clone, Copy)]
pub struct Frame {
    pub base: usize,
    pub reg_count: u16,
    /// Index of the executing function in the VM's function table
    pub func: usize,
    pub pc: i32,
    /// Caller pc to resume at after RET (-1 for the entry frame)
    pub return_pc: i32,
    /// Caller register for the return value (255 = discard)
    pub return_dst: u8,
}

/// Register storage and the call stack.
pub struct FrameStack {
    values: Vec<Value>,
    frames: Vec<Frame>,
}

impl FrameStack {
    pub fn new() -> Self {
        FrameStack {
            values: Vec::with_capacity(VALUE_STACK_CAPACITY),
            frames: Vec::new(),
        }
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Append a Nil-initialized register window and make it current.
    pub fn push_frame(
        &mut self,
        func: usize,
        reg_count: u16,
        return_pc: i32,
        return_dst: u8,
    ) -> Result<usize, VmError> {
        let base = self.values.len();
        if base + reg_count as usize > self.values.capacity() {
            return Err(VmError::StackOverflow);
        }
        self.values.resize(base + reg_count as usize, Value::Nil);
        self.frames.push(Frame {
            base,
            reg_count,
            func,
            pc: 0,
            return_pc,
            return_dst,
        });
        Ok(self.frames.len() - 1)
    }

    /// Drop the current frame and its register window.
    pub fn pop_frame(&mut self) -> Option<Frame> {
        let frame = self.frames.pop()?;
        self.values.truncate(frame.base);
        Some(frame)
    }

    pub fn current(&self) -> &Frame {
        self.frames.last().expect("call stack is empty")
    }

    pub fn current_mut(&mut self) -> &mut Frame {
        self.frames.last_mut().expect("call stack is empty")
    }

    pub fn reg(&self, idx: u8) -> Value {
        let frame = self.current();
        assert!((idx as u16) < frame.reg_count, "register {idx} out of window");
        self.values[frame.base + idx as usize]
    }

    pub fn set_reg(&mut self, idx: u8, v: Value) {
        let frame = *self.current();
        assert!((idx as u16) < frame.reg_count, "register {idx} out of window");
        self.values[frame.base + idx as usize] = v;
    }

    /// Copy the caller's staged arguments R[0..argc) into the freshly
    /// pushed callee window.
    pub fn copy_args_from_caller(&mut self, argc: usize) {
        debug_assert!(self.frames.len() >= 2);
        let callee = self.frames[self.frames.len() - 1];
        let caller = self.frames[self.frames.len() - 2];
        for i in 0..argc {
            self.values[callee.base + i] = self.values[caller.base + i];
        }
    }

    /// Base pointer of the current register window, for emitted code.
    pub(crate) fn regs_base_ptr(&mut self) -> *mut Value {
        let base = self.current().base;
        &mut self.values[base] as *mut Value
    }

    /// Mark every register of every frame. Constant pools are marked by
    /// the VM, which owns the function table.
    pub fn mark_roots(&self, marker: &mut Marker) {
        for frame in &self.frames {
            for i in 0..frame.reg_count as usize {
                marker.mark_value(self.values[frame.base + i]);
            }
        }
    }
}

impl Default for FrameStack {
    fn default() -> Self {
        Self::new()
    }
}
