//! TLS template access and relocation arithmetic.
//!
//! The process-wide TLS template (the `.tdata` image plus the zero-filled `.tbss`
//! tail) is modelled as a read-only collaborator, [`TlsTemplate`], instead of
//! being read from globals directly. On `wasm32` the real implementation is
//! [`WasmTls`](crate::wasm::WasmTls).

use core::ptr::NonNull;

/// Read-only view of the process-wide TLS template.
pub trait TlsTemplate {
    /// Size of the TLS image in bytes.
    fn size(&self) -> usize;

    /// Alignment the TLS image requires. A power of two.
    fn align(&self) -> usize;

    /// TLS base of the calling thread.
    fn base_addr(&self) -> usize;

    /// Byte offset from a TLS base to the TCB embedded in that TLS block.
    ///
    /// Fixed at link time and the same for every thread in the process.
    fn tcb_offset(&self) -> usize;

    /// Copies the template into `dst` and returns the new TLS base.
    ///
    /// The returned base is `dst` rounded up to [`align()`](Self::align); callers
    /// must reserve `size() + align()` bytes at `dst`.
    ///
    /// # Safety
    ///
    /// `dst` must be valid for writes of `size() + align()` bytes and not be
    /// accessed concurrently.
    unsafe fn copy_into(&self, dst: NonNull<u8>) -> Result<NonNull<u8>, TlsCopyError>;
}

/// Errors produced by [`TlsTemplate::copy_into`].
#[derive(Debug, thiserror::Error)]
pub enum TlsCopyError {
    /// The template reported an alignment that is zero or not a power of two.
    #[error("Invalid TLS alignment: {0}")]
    InvalidAlignment(usize),

    /// Rounding the destination up to the TLS alignment overflowed the address space.
    #[error("TLS destination {addr:#x} cannot be aligned to {align}")]
    AddressOverflow {
        /// Destination address.
        addr: usize,
        /// Requested alignment.
        align: usize,
    },
}

/// Rounds `addr` up to the next multiple of `align`.
///
/// Returns `None` if `align` is not a power of two or the result overflows.
#[inline]
pub const fn align_up(addr: usize, align: usize) -> Option<usize> {
    if !align.is_power_of_two() {
        return None;
    }

    match addr.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

/// Rounds `addr` down to a multiple of `align`. `align` must be a power of two.
#[inline]
pub const fn align_down(addr: usize, align: usize) -> usize {
    addr & !(align - 1)
}

/// Address of the TCB inside the TLS block based at `tls_base`.
#[inline]
pub const fn tcb_addr(tls_base: usize, tcb_offset: usize) -> usize {
    tls_base.wrapping_add(tcb_offset)
}

/// Translates `addr` by the distance between two TLS bases.
///
/// An address inside the TLS block at `from_base` maps to the address at the same
/// relative position in the block at `to_base`. The delta may be negative, so
/// the arithmetic wraps.
#[inline]
pub const fn relocate(addr: usize, from_base: usize, to_base: usize) -> usize {
    addr.wrapping_add(to_base.wrapping_sub(from_base))
}

/// Rounds a copy destination up to `align`, keeping `dst`'s provenance.
///
/// Shared by [`TlsTemplate`] implementations.
pub fn aligned_destination(dst: NonNull<u8>, align: usize) -> Result<NonNull<u8>, TlsCopyError> {
    let addr = dst.as_ptr() as usize;
    if !align.is_power_of_two() {
        return Err(TlsCopyError::InvalidAlignment(align));
    }
    let Some(aligned) = align_up(addr, align) else {
        return Err(TlsCopyError::AddressOverflow { addr, align });
    };

    // SAFETY: `aligned - addr < align`, which stays within the `size + align`
    // bytes the caller reserved at `dst`.
    Ok(unsafe { dst.add(aligned - addr) })
}
