//! Thread bootstrap
//!
//! Builds the region a new thread starts on and initializes its TCB. The result
//! is the `(tls_base, stack_ptr)` pair the host's `thread-spawn` needs; nothing
//! is spawned here.

use core::ptr::{self, NonNull};

use wasi_sys_tls::{
    self as tls, PTHREAD_KEYS_MAX, Pthread, TcbInit, TlsCopyError, TlsTemplate,
};

use crate::{LayoutError, REGION_ALIGN, RegionAlloc, RegionLayout};

/// A bootstrapped thread, ready to be spawned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewThread {
    /// TLS base for the new thread's `__tls_base`.
    pub tls_base: NonNull<u8>,

    /// Initial stack pointer for the new thread's `__stack_pointer`.
    pub stack_ptr: NonNull<u8>,

    /// The new thread's TCB, inside the TLS block at `tls_base`.
    pub tcb: NonNull<Pthread>,
}

/// Builds the memory region for a new thread.
///
/// Allocates one region from `alloc`, copies the TLS template into it, and
/// initializes the TCB embedded in the copy. The new TCB inherits `canary` and
/// `sysinfo` from `current` and is created detached.
///
/// On error nothing is leaked: a region allocated before the failure is handed
/// back to `alloc`.
///
/// # Safety
///
/// - `current` must point to the calling thread's live TCB, located inside the
///   TLS block at `template.base_addr()`.
/// - `template` must describe the TLS image that `current`'s block was built from.
pub unsafe fn new_thread<T, A>(
    template: &T,
    alloc: &A,
    current: NonNull<Pthread>,
) -> Result<NewThread, ThreadCreateError>
where
    T: TlsTemplate + ?Sized,
    A: RegionAlloc + ?Sized,
{
    let layout = RegionLayout::compute(template.size(), template.align())?;

    let Some(map) = alloc.alloc(layout.map_size()) else {
        #[cfg(feature = "log")]
        log::debug!(
            "thread region allocation of {} bytes failed",
            layout.map_size()
        );
        return Err(ThreadCreateError::OutOfMemory);
    };
    debug_assert_eq!(map.as_ptr() as usize % REGION_ALIGN, 0);

    // SAFETY: `map` is a fresh allocation of `layout.map_size()` bytes, and the
    // caller's guarantees about `current` and `template` are forwarded.
    match unsafe { init_region(template, layout, map, current) } {
        Ok(thread) => {
            #[cfg(feature = "log")]
            log::trace!(
                "thread region {:p}+{:#x}: tls_base={:p} stack_ptr={:p} tcb={:p}",
                map,
                layout.map_size(),
                thread.tls_base,
                thread.stack_ptr,
                thread.tcb
            );
            Ok(thread)
        }
        Err(err) => {
            #[cfg(feature = "log")]
            log::debug!("thread bootstrap failed: {err}");

            // SAFETY: `map` came from `alloc` with this size and nothing else
            // refers to it yet.
            unsafe { alloc.dealloc(map, layout.map_size()) };
            Err(err)
        }
    }
}

/// Partitions `map`, copies the TLS template and initializes the new TCB.
///
/// # Safety
///
/// `map` must be valid for writes of `layout.map_size()` bytes. See [`new_thread`]
/// for `template` and `current`.
unsafe fn init_region<T>(
    template: &T,
    layout: RegionLayout,
    map: NonNull<u8>,
    current: NonNull<Pthread>,
) -> Result<NewThread, ThreadCreateError>
where
    T: TlsTemplate + ?Sized,
{
    let region = layout.partition(map);

    // SAFETY: The TLS slice is `template.size() + template.align()` bytes.
    let tls_base = unsafe { template.copy_into(region.tls)? };

    // The TCB sits at the same offset in every TLS block, so moving the TLS base
    // by some delta moves the TCB by the same delta.
    let map_addr = map.as_ptr() as usize;
    let tcb_addr = tls::relocate(
        current.as_ptr() as usize,
        template.base_addr(),
        tls_base.as_ptr() as usize,
    );
    debug_assert_eq!(
        tcb_addr,
        tls::tcb_addr(tls_base.as_ptr() as usize, template.tcb_offset())
    );
    if !region.tls_contains(tcb_addr, size_of::<Pthread>())
        || tcb_addr % align_of::<Pthread>() != 0
    {
        return Err(ThreadCreateError::TcbOutOfBounds { addr: tcb_addr });
    }

    // SAFETY: `tcb_addr` was checked to lie inside the region above.
    let tcb = unsafe { map.add(tcb_addr - map_addr) }.cast::<Pthread>();

    // SAFETY: The caller guarantees `current` is a live TCB.
    let (canary, sysinfo) = unsafe { tls::inherited_words(current) };

    // SAFETY: The TSD table is `PTHREAD_KEYS_MAX` pointer slots at the top of
    // the region, disjoint from the TLS slice.
    unsafe { ptr::write_bytes(region.tsd.as_ptr(), 0, PTHREAD_KEYS_MAX) };

    // SAFETY: `tcb` is in bounds and aligned, and the region is not shared yet.
    unsafe {
        tls::init_bootstrap(
            tcb,
            TcbInit {
                map_base: region.map_base,
                map_size: region.map_size,
                stack: region.stack,
                stack_size: region.stack_size(),
                tsd: region.tsd,
                canary,
                sysinfo,
            },
        )
    };

    Ok(NewThread {
        tls_base,
        stack_ptr: region.stack,
        tcb,
    })
}

/// Bootstraps a new thread from the calling thread, using the module's TLS
/// template and the C runtime's `malloc`.
#[cfg(target_arch = "wasm32")]
pub fn new_thread_current() -> Result<NewThread, ThreadCreateError> {
    use wasi_sys_tls::wasm;

    use crate::LibcMalloc;

    // SAFETY: `current_tcb()` is the calling thread's TCB, embedded in the TLS
    // block at `__tls_base`, and `WasmTls` describes the module's own template.
    unsafe { new_thread(&wasm::WasmTls, &LibcMalloc, wasm::current_tcb()) }
}

/// Thread bootstrap errors
#[derive(Debug, thiserror::Error)]
pub enum ThreadCreateError {
    /// The backing allocator could not provide the thread region.
    #[error("Out of memory")]
    OutOfMemory,

    /// The TLS template's size or alignment cannot be laid out.
    #[error("Invalid thread region layout: {0}")]
    Layout(#[from] LayoutError),

    /// Copying the TLS template into the new region failed.
    #[error("TLS template copy failed: {0}")]
    TlsCopy(#[from] TlsCopyError),

    /// The relocated TCB does not fit inside the new TLS image.
    ///
    /// The template's base address or TCB offset is inconsistent with its size.
    #[error("TCB address {addr:#x} falls outside the new TLS image")]
    TcbOutOfBounds {
        /// The relocated TCB address.
        addr: usize,
    },
}

impl ThreadCreateError {
    /// Returns `true` for resource exhaustion, `false` for platform-query failures.
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, Self::OutOfMemory)
    }
}
