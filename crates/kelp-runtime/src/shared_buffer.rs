//! Reference-counted byte buffers shared between worker threads.
//!
//! A buffer is a single allocation: a header holding the atomic reference
//! count, followed inline by the zero-initialized payload. [`SharedBuffer`]
//! owns one reference; cloning it is a dup and dropping it a release, and the
//! allocation is freed by whichever thread drops the last reference.
//!
//! The payload is exposed as atomic bytes because several threads may read
//! and write it at the same time (the `SharedArrayBuffer` model).

use std::alloc::{self, Layout};
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering, fence};

use tracing::trace;

#[derive(Debug, Default)]
struct ShareStats {
    allocated: AtomicUsize,
    freed: AtomicUsize,
}

/// Allocator for shared buffers, with live-allocation accounting.
///
/// Clones share the same counters, so a runtime and the workers it spawns can
/// report on one pool.
#[derive(Debug, Clone, Default)]
pub struct ShareRegistry {
    stats: Arc<ShareStats>,
}

impl ShareRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a zeroed buffer with a reference count of one.
    ///
    /// Returns `None` when the allocation fails; nothing is left behind.
    pub fn alloc(&self, len: usize) -> Option<SharedBuffer> {
        let (layout, offset) = buffer_layout(len)?;
        // SAFETY: the layout is never zero-sized, it always contains the header.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let header = NonNull::new(raw)?.cast::<Header>();
        // SAFETY: `raw` is a fresh allocation sized and aligned for the header.
        unsafe {
            header.as_ptr().write(Header {
                count: AtomicUsize::new(1),
                len,
                offset,
                stats: Arc::clone(&self.stats),
            });
        }
        self.stats.allocated.fetch_add(1, Ordering::Relaxed);
        trace!(len, "shared buffer allocated");
        Some(SharedBuffer { header })
    }

    /// Buffers allocated and not yet freed
    pub fn live(&self) -> usize {
        self.allocated() - self.freed()
    }

    /// Buffers allocated so far
    pub fn allocated(&self) -> usize {
        self.stats.allocated.load(Ordering::Acquire)
    }

    /// Buffers freed so far
    pub fn freed(&self) -> usize {
        self.stats.freed.load(Ordering::Acquire)
    }
}

struct Header {
    count: AtomicUsize,
    len: usize,
    offset: usize,
    stats: Arc<ShareStats>,
}

fn buffer_layout(len: usize) -> Option<(Layout, usize)> {
    let payload = Layout::array::<AtomicU8>(len).ok()?;
    let (layout, offset) = Layout::new::<Header>().extend(payload).ok()?;
    Some((layout.pad_to_align(), offset))
}

/// One reference to a shared buffer.
pub struct SharedBuffer {
    header: NonNull<Header>,
}

// SAFETY: the header is only mutated through atomics and the payload is a
// slice of atomic bytes.
unsafe impl Send for SharedBuffer {}
// SAFETY: see above.
unsafe impl Sync for SharedBuffer {}

impl SharedBuffer {
    fn header(&self) -> &Header {
        // SAFETY: the allocation lives while this reference exists.
        unsafe { self.header.as_ref() }
    }

    /// Payload length in bytes
    pub fn len(&self) -> usize {
        self.header().len
    }

    /// Whether the payload is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current reference count
    pub fn ref_count(&self) -> usize {
        self.header().count.load(Ordering::Acquire)
    }

    /// Payload bytes
    pub fn bytes(&self) -> &[AtomicU8] {
        let header = self.header();
        // SAFETY: the payload lives `offset` bytes past the header and holds
        // `len` zero-initialized atomic bytes.
        unsafe {
            let data = self.header.as_ptr().cast::<u8>().add(header.offset);
            std::slice::from_raw_parts(data.cast::<AtomicU8>(), header.len)
        }
    }

    /// Copy `out.len()` bytes starting at `offset` into `out`.
    ///
    /// Returns `false` without copying when the range is out of bounds.
    pub fn read(&self, offset: usize, out: &mut [u8]) -> bool {
        let Some(range) = self.bytes().get(offset..offset.saturating_add(out.len())) else {
            return false;
        };
        for (dst, src) in out.iter_mut().zip(range) {
            *dst = src.load(Ordering::Relaxed);
        }
        true
    }

    /// Copy `data` into the payload starting at `offset`.
    ///
    /// Returns `false` without writing when the range is out of bounds.
    pub fn write(&self, offset: usize, data: &[u8]) -> bool {
        let Some(range) = self.bytes().get(offset..offset.saturating_add(data.len())) else {
            return false;
        };
        for (dst, src) in range.iter().zip(data) {
            dst.store(*src, Ordering::Relaxed);
        }
        true
    }

    /// Copy the whole payload out
    pub fn to_vec(&self) -> Vec<u8> {
        self.bytes()
            .iter()
            .map(|b| b.load(Ordering::Relaxed))
            .collect()
    }

    /// Whether two references point at the same buffer
    pub fn ptr_eq(a: &SharedBuffer, b: &SharedBuffer) -> bool {
        a.header == b.header
    }

    /// Pointer to the payload, as handed to an engine's array buffer
    pub fn as_ptr(&self) -> *const u8 {
        self.bytes().as_ptr().cast::<u8>()
    }

    /// Give up this reference without releasing it, returning the payload
    /// pointer.
    pub fn into_raw(self) -> *const u8 {
        let ptr = self.as_ptr();
        std::mem::forget(self);
        ptr
    }

    /// Reclaim a reference previously leaked with [`SharedBuffer::into_raw`].
    ///
    /// # Safety
    ///
    /// `ptr` must come from `into_raw` and its reference must not have been
    /// reclaimed already.
    pub unsafe fn from_raw(ptr: *const u8) -> SharedBuffer {
        // Byte-aligned payloads start right after the header whatever the
        // length.
        let offset = size_of::<Header>();
        // SAFETY: the caller guarantees `ptr` points `offset` bytes past a
        // live header.
        let header = unsafe { ptr.sub(offset) } as *mut Header;
        SharedBuffer {
            // SAFETY: derived from a non-null payload pointer.
            header: unsafe { NonNull::new_unchecked(header) },
        }
    }
}

impl Clone for SharedBuffer {
    fn clone(&self) -> Self {
        // Relaxed is enough: the caller already holds a reference.
        self.header().count.fetch_add(1, Ordering::Relaxed);
        SharedBuffer {
            header: self.header,
        }
    }
}

impl Drop for SharedBuffer {
    fn drop(&mut self) {
        if self.header().count.fetch_sub(1, Ordering::Release) != 1 {
            return;
        }
        fence(Ordering::Acquire);

        let len = self.header().len;
        let Some((layout, _)) = buffer_layout(len) else {
            return;
        };
        let stats = Arc::clone(&self.header().stats);
        // SAFETY: this was the last reference; nobody can observe the header
        // any more. The layout is the one used for the allocation.
        unsafe {
            std::ptr::drop_in_place(self.header.as_ptr());
            alloc::dealloc(self.header.as_ptr().cast::<u8>(), layout);
        }
        stats.freed.fetch_add(1, Ordering::AcqRel);
        trace!(len, "shared buffer freed");
    }
}

impl fmt::Debug for SharedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedBuffer")
            .field("len", &self.len())
            .field("refs", &self.ref_count())
            .finish()
    }
}
