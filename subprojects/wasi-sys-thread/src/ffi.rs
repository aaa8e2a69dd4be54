//! C FFI bindings for wasi-sys-thread.

use core::ffi::c_int;

use crate::ThreadCreateError;

/// `ENOMEM` as defined by wasi-libc (`__WASI_ERRNO_NOMEM`).
pub const ENOMEM: c_int = 48;

/// `EINVAL` as defined by wasi-libc (`__WASI_ERRNO_INVAL`).
pub const EINVAL: c_int = 28;

/// C FFI: Builds the TLS block and stack for a new thread.
///
/// On success writes the new TLS base and stack pointer to the out parameters
/// and returns 0. On failure returns `ENOMEM` or `EINVAL` and leaves the out
/// parameters untouched.
///
/// # Safety
///
/// Both out pointers must be valid for writes. Must be called from a thread
/// whose TCB was set up by the C runtime or by this function.
#[cfg(target_arch = "wasm32")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn wasi_new_thread(
    out_new_tls_base: *mut *mut core::ffi::c_void,
    out_new_stack: *mut *mut core::ffi::c_void,
) -> c_int {
    if out_new_tls_base.is_null() || out_new_stack.is_null() {
        return EINVAL;
    }

    match crate::new_thread_current() {
        Ok(thread) => {
            // SAFETY: Both pointers were checked for null and the caller
            // guarantees they are writable.
            unsafe {
                out_new_tls_base.write(thread.tls_base.as_ptr().cast());
                out_new_stack.write(thread.stack_ptr.as_ptr().cast());
            }
            0
        }
        Err(err) => thread_create_error_to_errno(&err),
    }
}

/// Maps a [`ThreadCreateError`] to the errno the C caller sees.
pub fn thread_create_error_to_errno(err: &ThreadCreateError) -> c_int {
    match err {
        ThreadCreateError::OutOfMemory => ENOMEM,
        ThreadCreateError::Layout(_)
        | ThreadCreateError::TlsCopy(_)
        | ThreadCreateError::TcbOutOfBounds { .. } => EINVAL,
    }
}
