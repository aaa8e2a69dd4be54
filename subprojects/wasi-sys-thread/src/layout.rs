//! Region layout
//!
//! A new thread is backed by a single allocation, split from the high end down:
//!
//! ```text
//! map_base + map_size ┌──────────────────────────┐
//!                     │ TSD table                │ TSD_TABLE_SIZE
//!          tsd ─────► ├──────────────────────────┤
//!                     │ TLS image                │ tls_size + tls_align
//!                     │   (TCB embedded inside)  │
//!          tls ─────► ├──────────────────────────┤ ◄── stack (rounded down to 16)
//!                     │ stack                    │
//!                     │   grows down             │
//!                     │   ↓                      │
//! map_base ─────────► └──────────────────────────┘ ◄── stack limit
//! ```
//!
//! No guard region is carved: linear memory has no page protection to trap on.

use core::{ffi::c_void, ptr::NonNull};

use static_assertions::const_assert;
use wasi_sys_tls::{TSD_TABLE_SIZE, align_down, align_up};

/// Default stack size for threads created by the bootstrap path (64 KiB).
pub const DEFAULT_STACK_SIZE: usize = 64 * 1024;

/// Alignment of the region size, and the minimum alignment of the region base.
pub const REGION_ALIGN: usize = 16;

/// Stack pointer alignment required by the wasm C ABI.
pub const STACK_ALIGN: usize = 16;

const_assert!(REGION_ALIGN.is_power_of_two());
const_assert!(STACK_ALIGN.is_power_of_two());
const_assert!(DEFAULT_STACK_SIZE % STACK_ALIGN == 0);

/// Sizes and offsets of a thread's memory region.
///
/// Computed before anything is allocated; offsets are relative to the region base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionLayout {
    tls_size: usize,
    tsd_size: usize,
    map_size: usize,
}

impl RegionLayout {
    /// Computes the layout for a TLS template of `tls_size` bytes aligned to `tls_align`.
    ///
    /// The TLS slice is padded by `tls_align` bytes so the copy can be aligned
    /// wherever the allocation lands.
    pub fn compute(tls_size: usize, tls_align: usize) -> Result<Self, LayoutError> {
        if !tls_align.is_power_of_two() {
            return Err(LayoutError::InvalidAlignment(tls_align));
        }

        let tls_size = tls_size
            .checked_add(tls_align)
            .ok_or(LayoutError::SizeOverflow)?;
        let tsd_size = TSD_TABLE_SIZE;

        let map_size = tls_size
            .checked_add(DEFAULT_STACK_SIZE)
            .and_then(|size| size.checked_add(tsd_size))
            .and_then(|size| align_up(size, REGION_ALIGN))
            .ok_or(LayoutError::SizeOverflow)?;

        Ok(Self {
            tls_size,
            tsd_size,
            map_size,
        })
    }

    /// Size of the TLS slice, including alignment padding.
    pub fn tls_size(&self) -> usize {
        self.tls_size
    }

    /// Size of the TSD table.
    pub fn tsd_size(&self) -> usize {
        self.tsd_size
    }

    /// Total size of the allocation.
    pub fn map_size(&self) -> usize {
        self.map_size
    }

    /// Offset of the TSD table from the region base.
    pub fn tsd_offset(&self) -> usize {
        self.map_size - self.tsd_size
    }

    /// Offset of the TLS slice from the region base.
    pub fn tls_offset(&self) -> usize {
        self.tsd_offset() - self.tls_size
    }

    /// Splits an allocation of [`map_size()`](Self::map_size) bytes at `base`.
    pub fn partition(&self, base: NonNull<u8>) -> Region {
        // SAFETY: Both offsets are below `map_size`, so the results stay inside
        // the allocation.
        let tsd = unsafe { base.add(self.tsd_offset()) };
        let tls = unsafe { base.add(self.tls_offset()) };

        let tls_addr = tls.as_ptr() as usize;
        let stack_addr = align_down(tls_addr, STACK_ALIGN);

        // SAFETY: `stack_addr` is at most `STACK_ALIGN - 1` bytes below `tls` and at
        // least `DEFAULT_STACK_SIZE` bytes above `base`.
        let stack = unsafe { tls.sub(tls_addr - stack_addr) };

        Region {
            map_base: base,
            map_size: self.map_size,
            stack,
            tls,
            tsd: tsd.cast(),
        }
    }
}

/// A partitioned thread memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    /// Base of the allocation. Also the stack limit.
    pub map_base: NonNull<u8>,

    /// Size of the allocation.
    pub map_size: usize,

    /// Top of the stack, aligned to [`STACK_ALIGN`].
    pub stack: NonNull<u8>,

    /// Destination of the TLS image copy.
    pub tls: NonNull<u8>,

    /// TSD table.
    pub tsd: NonNull<*mut c_void>,
}

impl Region {
    /// The lowest usable stack address.
    pub fn stack_limit(&self) -> NonNull<u8> {
        self.map_base
    }

    /// Bytes between the stack top and the stack limit.
    pub fn stack_size(&self) -> usize {
        self.stack.as_ptr() as usize - self.stack_limit().as_ptr() as usize
    }

    /// Returns `true` if `[addr, addr + len)` lies inside the TLS slice.
    pub fn tls_contains(&self, addr: usize, len: usize) -> bool {
        let start = self.tls.as_ptr() as usize;
        let end = self.tsd.as_ptr() as usize;
        addr >= start && addr.checked_add(len).is_some_and(|last| last <= end)
    }
}

/// Errors computing a [`RegionLayout`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LayoutError {
    /// The TLS alignment is zero or not a power of two.
    #[error("Invalid TLS alignment: {0}")]
    InvalidAlignment(usize),

    /// The region size does not fit in the address space.
    #[error("Thread region size overflows")]
    SizeOverflow,
}
