//! `wasm32` TLS template backed by the linker-synthesized TLS symbols.
//!
//! `wasm-ld` emits `__tls_size`, `__tls_align` and `__tls_base` as wasm globals
//! (not memory), so they are read with `global.get` rather than through a
//! `static`. `__wasm_init_tls` is an ordinary function.
//!
//! ## References
//! - [LLVM: lld/wasm/Writer.cpp](https://github.com/llvm/llvm-project/blob/main/lld/wasm/Writer.cpp)
//! - [wasi-libc: pthread_create.c](https://github.com/WebAssembly/wasi-libc/blob/main/libc-top-half/musl/src/thread/pthread_create.c)

use core::{
    arch::asm,
    ffi::c_void,
    ptr::{self, NonNull},
};

use crate::{Pthread, TlsCopyError, TlsTemplate, aligned_destination};

// SAFETY: Both symbols are provided when linking a shared-memory module
// against the C runtime.
unsafe extern "C" {
    /// Copies `.tdata` to `mem` and sets `__tls_base` to `mem` on the calling
    /// instance. Does not touch `.tbss`.
    fn __wasm_init_tls(mem: *mut c_void);

    /// Returns the calling thread's TCB (`&__wasilibc_pthread_self`).
    fn pthread_self() -> *mut Pthread;
}

/// Reads the `__tls_size` global.
#[inline]
pub fn tls_size() -> usize {
    let size: usize;
    // SAFETY: Reading an immutable linker-synthesized global has no side effects.
    unsafe {
        asm!(
            ".globaltype __tls_size, i32, immutable",
            "global.get __tls_size",
            "local.set {}",
            out(local) size,
            options(nostack, nomem),
        );
    }
    size
}

/// Reads the `__tls_align` global.
#[inline]
pub fn tls_align() -> usize {
    let align: usize;
    // SAFETY: Reading an immutable linker-synthesized global has no side effects.
    unsafe {
        asm!(
            ".globaltype __tls_align, i32, immutable",
            "global.get __tls_align",
            "local.set {}",
            out(local) align,
            options(nostack, nomem),
        );
    }
    align
}

/// Reads the calling instance's `__tls_base` global.
#[inline]
pub fn tls_base() -> usize {
    let base: usize;
    // SAFETY: Reading the global has no side effects. Each thread runs in its own
    // instance, so the value is this thread's TLS base.
    unsafe {
        asm!(
            ".globaltype __tls_base, i32",
            "global.get __tls_base",
            "local.set {}",
            out(local) base,
            options(nostack, nomem),
        );
    }
    base
}

/// Returns the calling thread's TCB.
#[inline]
pub fn current_tcb() -> NonNull<Pthread> {
    // SAFETY: `pthread_self` returns the address of a thread-local variable,
    // which is never null once the runtime has started.
    unsafe { NonNull::new_unchecked(pthread_self()) }
}

/// The module's own TLS template.
#[derive(Debug, Clone, Copy, Default)]
pub struct WasmTls;

impl TlsTemplate for WasmTls {
    fn size(&self) -> usize {
        tls_size()
    }

    fn align(&self) -> usize {
        tls_align()
    }

    fn base_addr(&self) -> usize {
        tls_base()
    }

    fn tcb_offset(&self) -> usize {
        (current_tcb().as_ptr() as usize).wrapping_sub(tls_base())
    }

    unsafe fn copy_into(&self, dst: NonNull<u8>) -> Result<NonNull<u8>, TlsCopyError> {
        let base = aligned_destination(dst, tls_align())?;
        let current_base = tls_base();

        // SAFETY: The caller reserved `size + align` bytes at `dst`; `base` is
        // within the padding, so `size` bytes from `base` are writable. The block
        // is zeroed first so `.tbss` starts out zero-filled.
        unsafe {
            ptr::write_bytes(base.as_ptr(), 0, tls_size());
            __wasm_init_tls(base.as_ptr().cast());
        }

        // `__wasm_init_tls` also retargets this instance's `__tls_base`. Put it
        // back so the creating thread keeps its own TLS.
        // SAFETY: Restores the value read above; nothing ran in between.
        unsafe { set_tls_base(current_base) };

        Ok(base)
    }
}

/// Writes the calling instance's `__tls_base` global.
///
/// # Safety
///
/// `base` must be the base of a fully initialized TLS block owned by the calling
/// thread.
#[inline]
unsafe fn set_tls_base(base: usize) {
    // SAFETY: Upheld by the caller.
    unsafe {
        asm!(
            ".globaltype __tls_base, i32",
            "local.get {}",
            "global.set __tls_base",
            in(local) base,
            options(nostack, nomem),
        );
    }
}
