//
// Licensed to the Apache Software Foundation (ASF) under one or more
// contributor license agreements.  See the NOTICE file distributed with
// this work for additional information regarding copyright ownership.
// The ASF licenses this file to You under the Apache License, Version 2.0
// (the "License"); you may not use this file except in compliance with
// the License.  You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! CPU/GPU-visible completion memory.
//!
//! All raw pointer access to completion memory lives in this module. Callers
//! see [`CompletionSlot`], a bounds-checked view with typed per-field
//! accessors and explicit `flush` / `invalidate` for non-coherent platforms.
//! Fields are accessed through atomics so a concurrent writer (GPU or a host
//! signal path on another thread) never produces a torn read.

use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering, fence};

use crate::error::{Result, ZtrackError};
use crate::platform::TagWidth;

/// Cache line size assumed for flush granularity and buffer alignment.
pub const CACHE_LINE_SIZE: usize = 64;

/// Backing allocation shared between one GPU writer path and host readers.
///
/// # Safety
/// `cpu_ptr()` must be valid for reads and writes of `size()` bytes for as long
/// as the implementor is alive, and aligned to at least 8 bytes. The GPU must
/// see the same bytes at `gpu_address()`.
pub unsafe trait CompletionMemory: Send + Sync {
    fn cpu_ptr(&self) -> NonNull<u8>;

    fn gpu_address(&self) -> u64;

    fn size(&self) -> usize;

    /// CPU caches snoop GPU accesses to this allocation.
    fn host_coherent(&self) -> bool {
        true
    }

    /// Push host writes in `[offset, offset + len)` out to memory.
    fn flush(&self, offset: usize, len: usize) -> Result<()> {
        // SAFETY: the range is inside the allocation per the trait contract; callers bound-check.
        unsafe { flush_cache_range(self.cpu_ptr().as_ptr().add(offset), len) };
        Ok(())
    }

    /// Drop stale host cache lines so the next read observes GPU writes.
    fn invalidate(&self, offset: usize, len: usize) -> Result<()> {
        // SAFETY: as in `flush`.
        unsafe { flush_cache_range(self.cpu_ptr().as_ptr().add(offset), len) };
        Ok(())
    }

    /// `DeviceLost` once the allocation (or the engine writing it) is gone.
    fn check_accessible(&self) -> Result<()> {
        Ok(())
    }
}

/// Write back and evict every cache line covering `[ptr, ptr + len)`.
///
/// # Safety
/// The range must lie inside a live allocation.
#[cfg(target_arch = "x86_64")]
unsafe fn flush_cache_range(ptr: *const u8, len: usize) {
    use std::arch::x86_64::{_mm_clflush, _mm_mfence};
    let start = ptr as usize & !(CACHE_LINE_SIZE - 1);
    let end = ptr as usize + len;
    let mut line = start;
    unsafe {
        _mm_mfence();
        while line < end {
            _mm_clflush(line as *const u8);
            line += CACHE_LINE_SIZE;
        }
        _mm_mfence();
    }
}

#[cfg(not(target_arch = "x86_64"))]
unsafe fn flush_cache_range(_ptr: *const u8, _len: usize) {
    fence(Ordering::SeqCst);
}

/// Host-allocated completion memory (shared virtual memory: the GPU address
/// equals the CPU address unless overridden).
pub struct HostCompletionBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
    gpu_base: u64,
    coherent: bool,
    lost: AtomicBool,
}

// SAFETY: the buffer is only accessed through atomics and explicit cache ops.
unsafe impl Send for HostCompletionBuffer {}
unsafe impl Sync for HostCompletionBuffer {}

impl HostCompletionBuffer {
    /// Allocate zeroed, cache-line aligned completion memory.
    ///
    /// # Arguments
    /// * `size_bytes` - Allocation size; must be non-zero
    ///
    /// Zeroed memory reads as signaled, so pools normally reset each event on
    /// creation.
    pub fn new(size_bytes: usize) -> Result<Self> {
        if size_bytes == 0 {
            return Err(ZtrackError::InvalidInput(
                "completion buffer size must be non-zero".to_string(),
            ));
        }
        let layout = Layout::from_size_align(size_bytes, CACHE_LINE_SIZE).map_err(|e| {
            ZtrackError::InvalidInput(format!(
                "invalid completion buffer layout ({} bytes): {}",
                size_bytes, e
            ))
        })?;
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or_else(|| {
            ZtrackError::OutOfHostMemory(format!(
                "failed to allocate {} bytes of completion memory",
                size_bytes
            ))
        })?;
        Ok(Self {
            ptr,
            layout,
            gpu_base: ptr.as_ptr() as u64,
            coherent: true,
            lost: AtomicBool::new(false),
        })
    }

    /// Override the GPU-visible base address (e.g. a separate GPU VA mapping).
    pub fn with_gpu_base(mut self, gpu_base: u64) -> Self {
        self.gpu_base = gpu_base;
        self
    }

    /// Declare whether CPU caches snoop GPU writes to this buffer.
    pub fn with_coherency(mut self, coherent: bool) -> Self {
        self.coherent = coherent;
        self
    }

    /// Report the backing memory as inaccessible (device reset or removal).
    pub fn mark_lost(&self) {
        self.lost.store(true, Ordering::Release);
    }
}

// SAFETY: `new` allocates `layout.size()` bytes aligned to CACHE_LINE_SIZE
// (64, so at least 8) and the allocation lives until `Drop`.
unsafe impl CompletionMemory for HostCompletionBuffer {
    fn cpu_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    fn gpu_address(&self) -> u64 {
        self.gpu_base
    }

    fn size(&self) -> usize {
        self.layout.size()
    }

    fn host_coherent(&self) -> bool {
        self.coherent
    }

    fn check_accessible(&self) -> Result<()> {
        if self.lost.load(Ordering::Acquire) {
            return Err(ZtrackError::DeviceLost(
                "completion memory is no longer accessible".to_string(),
            ));
        }
        Ok(())
    }
}

impl Drop for HostCompletionBuffer {
    fn drop(&mut self) {
        // SAFETY: ptr was returned by alloc_zeroed with this exact layout.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// One field of a timestamp packet, in memory order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacketField {
    ContextStart = 0,
    GlobalStart = 1,
    ContextEnd = 2,
    GlobalEnd = 3,
}

impl PacketField {
    pub const ALL: [PacketField; 4] = [
        PacketField::ContextStart,
        PacketField::GlobalStart,
        PacketField::ContextEnd,
        PacketField::GlobalEnd,
    ];
}

/// Bounds-checked view over one pool slot.
#[derive(Clone)]
pub struct CompletionSlot {
    memory: Arc<dyn CompletionMemory>,
    offset: usize,
    len: usize,
    width: TagWidth,
}

impl std::fmt::Debug for CompletionSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionSlot")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .field("width", &self.width)
            .finish()
    }
}

impl CompletionSlot {
    pub(crate) fn new(
        memory: Arc<dyn CompletionMemory>,
        offset: usize,
        len: usize,
        width: TagWidth,
    ) -> Result<Self> {
        let end = offset.checked_add(len).ok_or_else(|| {
            ZtrackError::InvalidInput(format!("slot range overflow at offset {}", offset))
        })?;
        if end > memory.size() {
            return Err(ZtrackError::InvalidInput(format!(
                "slot [{}, {}) exceeds completion memory of {} bytes",
                offset,
                end,
                memory.size()
            )));
        }
        if offset % width.bytes() != 0 || memory.cpu_ptr().as_ptr() as usize % 8 != 0 {
            return Err(ZtrackError::InvalidInput(format!(
                "slot offset {} is not aligned to {} bytes",
                offset,
                width.bytes()
            )));
        }
        Ok(Self {
            memory,
            offset,
            len,
            width,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn tag_width(&self) -> TagWidth {
        self.width
    }

    pub fn cpu_address(&self) -> usize {
        self.memory.cpu_ptr().as_ptr() as usize + self.offset
    }

    pub fn gpu_address(&self) -> u64 {
        self.memory.gpu_address() + self.offset as u64
    }

    pub fn host_coherent(&self) -> bool {
        self.memory.host_coherent()
    }

    fn field_offset(&self, packet: usize, field: PacketField) -> Result<usize> {
        let rel = packet
            .checked_mul(self.width.packet_size())
            .and_then(|p| p.checked_add(field as usize * self.width.bytes()))
            .filter(|rel| rel + self.width.bytes() <= self.len)
            .ok_or_else(|| {
                ZtrackError::InvalidInput(format!(
                    "packet {} field {:?} outside slot of {} bytes",
                    packet, field, self.len
                ))
            })?;
        Ok(rel)
    }

    /// GPU address of one packet field, for the dispatch collaborator.
    pub fn field_gpu_address(&self, packet: usize, field: PacketField) -> Result<u64> {
        Ok(self.gpu_address() + self.field_offset(packet, field)? as u64)
    }

    /// Atomically load one field with acquire ordering, zero-extended to `u64`.
    ///
    /// # Arguments
    /// * `packet` - Packet index from the start of the slot
    /// * `field` - Field within that packet
    ///
    /// `InvalidInput` if the field lies outside the slot, `DeviceLost` if the
    /// backing memory became inaccessible.
    pub fn read_field(&self, packet: usize, field: PacketField) -> Result<u64> {
        let rel = self.field_offset(packet, field)?;
        self.memory.check_accessible()?;
        // SAFETY: rel is bounds-checked against the slot, the slot against the
        // allocation, and alignment was checked at construction.
        let value = unsafe {
            let p = self.memory.cpu_ptr().as_ptr().add(self.offset + rel);
            match self.width {
                TagWidth::U32 => (*(p as *const AtomicU32)).load(Ordering::Acquire) as u64,
                TagWidth::U64 => (*(p as *const AtomicU64)).load(Ordering::Acquire),
            }
        };
        Ok(value)
    }

    /// Atomically store one field with release ordering. On 32-bit tags only
    /// the low half of `value` is written. Does not flush; callers on
    /// non-coherent memory follow up with [`CompletionSlot::flush`].
    ///
    /// `InvalidInput` if the field lies outside the slot.
    pub fn write_field(&self, packet: usize, field: PacketField, value: u64) -> Result<()> {
        let rel = self.field_offset(packet, field)?;
        // SAFETY: see read_field.
        unsafe {
            let p = self.memory.cpu_ptr().as_ptr().add(self.offset + rel);
            match self.width {
                TagWidth::U32 => (*(p as *const AtomicU32)).store(value as u32, Ordering::Release),
                TagWidth::U64 => (*(p as *const AtomicU64)).store(value, Ordering::Release),
            }
        }
        Ok(())
    }

    /// Flush the first `len` bytes of the slot.
    pub fn flush(&self, len: usize) -> Result<()> {
        self.memory.flush(self.offset, len.min(self.len))
    }

    pub fn invalidate(&self) -> Result<()> {
        self.memory.invalidate(self.offset, self.len)?;
        fence(Ordering::Acquire);
        Ok(())
    }

    pub fn check_accessible(&self) -> Result<()> {
        self.memory.check_accessible()
    }
}
