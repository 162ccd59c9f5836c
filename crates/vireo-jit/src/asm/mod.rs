//! Executable code arenas
//!
//! The JIT owns two growable-cursor, fixed-capacity executable buffers: the
//! inline block (hot code, jumped between directly) and the outlined block
//! (stubs, side exits, cold paths). Both are windows over a single mmap'd
//! RWX region so that rel32 jumps between them always reach.
//!
//! A `CodeBlock` tracks a write cursor, forward-referencable labels, and a
//! frozen watermark: once tracing invalidation has patched a prefix of the
//! inline block, those bytes must never be written again.

pub mod x86_64;

pub use x86_64::{Cond, Mem, Opnd, Reg};

use std::fmt;

/// Pointer into one of the code arenas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CodePtr(pub *const u8);

impl CodePtr {
    pub fn raw_ptr(self) -> *const u8 {
        self.0
    }

    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

// CodePtr values point into the process-lifetime code arenas.
unsafe impl Send for CodePtr {}
unsafe impl Sync for CodePtr {}

/// Error from the arena layer
#[derive(Debug, thiserror::Error)]
pub enum MemError {
    #[error("mmap of {0} bytes of executable memory failed")]
    MapFailed(usize),
}

/// One contiguous RWX allocation, later split into the inline and outlined
/// arenas. Kept alive for the life of the process; never unmapped.
pub struct ExecMem {
    ptr: *mut u8,
    size: usize,
}

unsafe impl Send for ExecMem {}

impl ExecMem {
    /// Map `size` bytes of read/write/execute memory.
    #[cfg(unix)]
    pub fn alloc(size: usize) -> Result<ExecMem, MemError> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(MemError::MapFailed(size));
        }
        Ok(ExecMem { ptr: ptr as *mut u8, size })
    }

    #[cfg(not(unix))]
    pub fn alloc(_size: usize) -> Result<ExecMem, MemError> {
        unimplemented!("executable memory is only supported on unix hosts");
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

/// A label awaiting placement and the rel32 references made to it.
struct LabelState {
    name: &'static str,
    pos: Option<usize>,
}

/// A 4-byte pc-relative displacement to patch once the label is written.
struct LabelRef {
    /// Position of the displacement field itself
    pos: usize,
    label_idx: usize,
}

/// An emit window over a span of executable memory.
pub struct CodeBlock {
    mem_block: *mut u8,
    mem_size: usize,
    write_pos: usize,
    /// Bytes below this watermark were patched for tracing invalidation and
    /// must not be mutated again.
    frozen_bytes: usize,
    labels: Vec<LabelState>,
    label_refs: Vec<LabelRef>,
    /// Set when a write ran past capacity. No partially-emitted block may
    /// become reachable once this is set.
    dropped_bytes: bool,
}

unsafe impl Send for CodeBlock {}

/// Refusal margin: a block compile does not begin unless at least this many
/// bytes remain in the arena.
pub const CODE_SAFETY_MARGIN: usize = 1024;

impl CodeBlock {
    /// Build a code block over `[mem, mem+size)`. The caller guarantees the
    /// span stays valid and writable for the life of the block.
    pub fn from_raw_parts(mem: *mut u8, size: usize) -> CodeBlock {
        CodeBlock {
            mem_block: mem,
            mem_size: size,
            write_pos: 0,
            frozen_bytes: 0,
            labels: Vec::new(),
            label_refs: Vec::new(),
            dropped_bytes: false,
        }
    }

    pub fn write_pos(&self) -> usize {
        self.write_pos
    }

    /// Move the cursor. Used when patching previously-emitted code; the
    /// caller is responsible for restoring the cursor afterwards.
    pub fn set_pos(&mut self, pos: usize) {
        assert!(pos <= self.mem_size);
        self.write_pos = pos;
    }

    pub fn get_ptr(&self, pos: usize) -> CodePtr {
        assert!(pos <= self.mem_size);
        CodePtr(unsafe { self.mem_block.add(pos) } as *const u8)
    }

    /// Pointer at the current cursor.
    pub fn get_write_ptr(&self) -> CodePtr {
        self.get_ptr(self.write_pos)
    }

    pub fn set_write_ptr(&mut self, ptr: CodePtr) {
        let pos = ptr.as_usize() - self.mem_block as usize;
        self.set_pos(pos);
    }

    /// Arena-relative position of a pointer into this block.
    pub fn pos_of(&self, ptr: CodePtr) -> usize {
        debug_assert!(self.contains(ptr) || ptr.as_usize() == self.mem_block as usize + self.mem_size);
        ptr.as_usize() - self.mem_block as usize
    }

    pub fn contains(&self, ptr: CodePtr) -> bool {
        let start = self.mem_block as usize;
        let p = ptr.as_usize();
        p >= start && p < start + self.mem_size
    }

    pub fn frozen_bytes(&self) -> usize {
        self.frozen_bytes
    }

    /// Raise the frozen watermark. Monotone by construction.
    pub fn freeze_up_to(&mut self, pos: usize) {
        assert!(
            pos >= self.frozen_bytes,
            "frozen bytes must increase monotonically"
        );
        assert!(pos <= self.mem_size);
        self.frozen_bytes = pos;
    }

    pub fn has_dropped_bytes(&self) -> bool {
        self.dropped_bytes
    }

    /// Remaining capacity check used before starting a block compile.
    pub fn has_capacity(&self, bytes: usize) -> bool {
        self.write_pos + bytes <= self.mem_size
    }

    pub fn write_byte(&mut self, byte: u8) {
        assert!(
            self.write_pos >= self.frozen_bytes,
            "rejected write below the frozen watermark"
        );
        if self.write_pos < self.mem_size {
            unsafe { self.mem_block.add(self.write_pos).write(byte) };
            self.write_pos += 1;
        } else {
            self.dropped_bytes = true;
        }
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.write_byte(b);
        }
    }

    pub fn write_i32(&mut self, val: i32) {
        self.write_bytes(&val.to_le_bytes());
    }

    pub fn write_u64(&mut self, val: u64) {
        self.write_bytes(&val.to_le_bytes());
    }

    /// Pad with single-byte nops until the cursor is `align`-aligned
    /// (relative to the start of the mapping, which is page-aligned).
    pub fn align(&mut self, align: usize) {
        debug_assert!(align.is_power_of_two());
        while (self.mem_block as usize + self.write_pos) & (align - 1) != 0 {
            self.write_byte(0x90);
        }
    }

    /// Pad with nops up to `pos`. Used when a re-emitted branch came out
    /// shorter than the original.
    pub fn pad_to(&mut self, pos: usize) {
        assert!(pos >= self.write_pos);
        while self.write_pos < pos {
            self.write_byte(0x90);
        }
    }

    /// Allocate a forward-referencable label.
    pub fn new_label(&mut self, name: &'static str) -> Label {
        self.labels.push(LabelState { name, pos: None });
        Label(self.labels.len() - 1)
    }

    /// Place a label at the current cursor.
    pub fn write_label(&mut self, label: Label) {
        debug_assert!(self.labels[label.0].pos.is_none(), "label written twice");
        self.labels[label.0].pos = Some(self.write_pos);
    }

    /// Record a rel32 reference to `label` and reserve its 4 bytes.
    pub(crate) fn label_ref(&mut self, label: Label) {
        self.label_refs.push(LabelRef { pos: self.write_pos, label_idx: label.0 });
        self.write_i32(0);
    }

    /// Patch every recorded label reference. All referenced labels must have
    /// been written.
    pub fn link_labels(&mut self) {
        let saved_pos = self.write_pos;
        for r in std::mem::take(&mut self.label_refs) {
            let target = self.labels[r.label_idx]
                .pos
                .unwrap_or_else(|| panic!("unlinked label: {}", self.labels[r.label_idx].name));
            let disp = target as i64 - (r.pos as i64 + 4);
            self.set_pos(r.pos);
            self.write_i32(i32::try_from(disp).expect("label displacement out of range"));
        }
        self.labels.clear();
        self.set_pos(saved_pos);
    }

    /// Copy of the emitted bytes in `[from, to)`, for inspection.
    pub fn byte_range(&self, from: usize, to: usize) -> Vec<u8> {
        assert!(from <= to && to <= self.mem_size);
        let mut out = vec![0; to - from];
        unsafe {
            std::ptr::copy_nonoverlapping(self.mem_block.add(from), out.as_mut_ptr(), to - from);
        }
        out
    }
}

impl fmt::Debug for CodeBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodeBlock")
            .field("write_pos", &self.write_pos)
            .field("mem_size", &self.mem_size)
            .field("frozen_bytes", &self.frozen_bytes)
            .finish()
    }
}

/// Handle to a label within one code block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

#[cfg(test)]
pub(crate) fn test_code_block(size: usize) -> CodeBlock {
    let buf: &'static mut [u8] = Box::leak(vec![0u8; size].into_boxed_slice());
    CodeBlock::from_raw_parts(buf.as_mut_ptr(), size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_and_read_back() {
        let mut cb = test_code_block(64);
        cb.write_bytes(&[0x90, 0xc3]);
        assert_eq!(cb.write_pos(), 2);
        assert_eq!(cb.byte_range(0, 2), vec![0x90, 0xc3]);
    }

    #[test]
    fn test_labels_link_forward_and_backward() {
        let mut cb = test_code_block(64);
        let top = cb.new_label("top");
        let done = cb.new_label("done");

        cb.write_label(top);
        cb.write_byte(0xe9); // jmp rel32 -> done (forward)
        cb.label_ref(done);
        cb.write_byte(0xe9); // jmp rel32 -> top (backward)
        cb.label_ref(top);
        cb.write_label(done);
        cb.link_labels();

        // First jump: disp from pos 5 to pos 10
        assert_eq!(cb.byte_range(1, 5), 5i32.to_le_bytes().to_vec());
        // Second jump: disp from pos 10 back to pos 0
        assert_eq!(cb.byte_range(6, 10), (-10i32).to_le_bytes().to_vec());
    }

    #[test]
    fn test_frozen_watermark_is_monotone() {
        let mut cb = test_code_block(64);
        cb.write_bytes(&[0; 16]);
        cb.freeze_up_to(8);
        cb.freeze_up_to(12);
        assert_eq!(cb.frozen_bytes(), 12);
    }

    #[test]
    #[should_panic(expected = "frozen bytes must increase monotonically")]
    fn test_frozen_watermark_cannot_lower() {
        let mut cb = test_code_block(64);
        cb.write_bytes(&[0; 16]);
        cb.freeze_up_to(12);
        cb.freeze_up_to(8);
    }

    #[test]
    #[should_panic(expected = "rejected write below the frozen watermark")]
    fn test_write_below_watermark_rejected() {
        let mut cb = test_code_block(64);
        cb.write_bytes(&[0; 16]);
        cb.freeze_up_to(16);
        cb.set_pos(4);
        cb.write_byte(0x90);
    }

    #[test]
    fn test_capacity_exhaustion_sets_dropped() {
        let mut cb = test_code_block(4);
        cb.write_bytes(&[1, 2, 3, 4, 5]);
        assert!(cb.has_dropped_bytes());
        assert!(!cb.has_capacity(CODE_SAFETY_MARGIN));
    }

    #[test]
    fn test_align_pads_with_nops() {
        let mut cb = test_code_block(64);
        cb.write_byte(0xc3);
        let base = cb.get_ptr(0).as_usize();
        cb.align(8);
        assert_eq!((base + cb.write_pos()) % 8, 0);
    }
}
