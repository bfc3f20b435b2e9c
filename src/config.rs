// src/config.rs

/// Maximum call depth before "Stack overflow." is raised.
pub const FRAMES_MAX: usize = 64;
/// Slots addressable by one frame (1-byte local operands).
pub const UINT8_COUNT: usize = u8::MAX as usize + 1;
pub const STACK_MAX: usize = FRAMES_MAX * UINT8_COUNT;

pub const GC_INITIAL_THRESHOLD: usize = 1024 * 1024;
pub const GC_HEAP_GROW_FACTOR: usize = 2;

/// Tunables for one VM instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmConfig {
    pub frames_max: usize,
    /// Value slots; a call whose frame could reach past this overflows.
    pub stack_max: usize,
    /// Bytes allocated before the first collection.
    pub gc_initial_threshold: usize,
    /// After a collection the next threshold is `retained * gc_grow_factor`.
    pub gc_grow_factor: usize,
    /// Collect before every allocation.
    pub gc_stress: bool,
    /// Emit a `trace!` event for every executed instruction.
    pub trace_execution: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            frames_max: FRAMES_MAX,
            stack_max: STACK_MAX,
            gc_initial_threshold: GC_INITIAL_THRESHOLD,
            gc_grow_factor: GC_HEAP_GROW_FACTOR,
            gc_stress: false,
            trace_execution: false,
        }
    }
}

impl VmConfig {
    pub fn with_frames_max(mut self, frames_max: usize) -> Self {
        self.frames_max = frames_max;
        self.stack_max = frames_max * UINT8_COUNT;
        self
    }

    pub fn with_stack_max(mut self, stack_max: usize) -> Self {
        self.stack_max = stack_max;
        self
    }

    pub fn with_gc_threshold(mut self, bytes: usize) -> Self {
        self.gc_initial_threshold = bytes;
        self
    }

    pub fn with_gc_grow_factor(mut self, factor: usize) -> Self {
        self.gc_grow_factor = factor.max(1);
        self
    }

    pub fn with_gc_stress(mut self, stress: bool) -> Self {
        self.gc_stress = stress;
        self
    }

    pub fn with_trace_execution(mut self, trace: bool) -> Self {
        self.trace_execution = trace;
        self
    }
}
