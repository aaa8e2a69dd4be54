//! Fake platform collaborators shared by the integration tests.

#![allow(dead_code)]

use std::{
    ptr::{self, NonNull},
    sync::atomic::{AtomicUsize, Ordering},
};

use wasi_sys_thread::{
    GlobalHeap, NewThread, RegionAlloc,
    tls::{Pthread, TlsCopyError, TlsTemplate, aligned_destination},
};

/// Size of the fake TLS image.
pub const TEMPLATE_SIZE: usize = 256;

/// Default alignment of the fake TLS image.
pub const TEMPLATE_ALIGN: usize = 16;

/// Offset of the TCB inside every fake TLS block.
pub const TCB_OFFSET: usize = 32;

/// Canary of the creating thread.
pub const CANARY: usize = 0x5A5A_1234;

/// `sysinfo` of the creating thread.
pub const SYSINFO: usize = 0x7E57;

/// Fill byte for the `.tdata` part of the fake template.
pub const TDATA_BYTE: u8 = 0xC3;

const _: () = assert!(TCB_OFFSET + size_of::<Pthread>() <= TEMPLATE_SIZE);
const _: () = assert!(TCB_OFFSET % align_of::<Pthread>() == 0);

#[repr(C, align(64))]
struct TlsBlock([u8; TEMPLATE_SIZE]);

/// A process with one running thread and a TLS template.
///
/// The template is `TDATA_BYTE` everywhere except the TCB window, which is zero
/// like `.tbss`.
pub struct FakeProcess {
    main_tls: Box<TlsBlock>,
    image: Vec<u8>,
    align: usize,
}

impl FakeProcess {
    pub fn new() -> Self {
        Self::with_align(TEMPLATE_ALIGN)
    }

    pub fn with_align(align: usize) -> Self {
        let mut image = vec![TDATA_BYTE; TEMPLATE_SIZE];
        image[TCB_OFFSET..TCB_OFFSET + size_of::<Pthread>()].fill(0);

        let mut main_tls = Box::new(TlsBlock([0; TEMPLATE_SIZE]));
        main_tls.0.copy_from_slice(&image);

        // SAFETY: The TCB window is in bounds and aligned, and zeroed bytes are
        // a valid `Pthread`.
        unsafe {
            let tcb = NonNull::from(&mut *main_tls)
                .cast::<u8>()
                .add(TCB_OFFSET)
                .cast::<Pthread>()
                .as_ptr();
            (*tcb).abi.self_ptr = tcb;
            (*tcb).abi.canary = CANARY;
            (*tcb).abi.sysinfo = SYSINFO;
        }

        Self {
            main_tls,
            image,
            align,
        }
    }

    /// The main thread's TCB.
    pub fn main_tcb(&self) -> NonNull<Pthread> {
        // SAFETY: `TCB_OFFSET` is inside the block.
        unsafe { NonNull::from(&*self.main_tls).cast::<u8>().add(TCB_OFFSET) }.cast()
    }
}

impl TlsTemplate for FakeProcess {
    fn size(&self) -> usize {
        self.image.len()
    }

    fn align(&self) -> usize {
        self.align
    }

    fn base_addr(&self) -> usize {
        self.main_tls.0.as_ptr() as usize
    }

    fn tcb_offset(&self) -> usize {
        TCB_OFFSET
    }

    unsafe fn copy_into(&self, dst: NonNull<u8>) -> Result<NonNull<u8>, TlsCopyError> {
        let base = aligned_destination(dst, self.align)?;
        // SAFETY: The caller reserved `size + align` bytes at `dst`.
        unsafe { ptr::copy_nonoverlapping(self.image.as_ptr(), base.as_ptr(), self.image.len()) };
        Ok(base)
    }
}

/// A template whose copy primitive always fails.
pub struct FailingCopy<'a>(pub &'a FakeProcess);

impl TlsTemplate for FailingCopy<'_> {
    fn size(&self) -> usize {
        self.0.size()
    }

    fn align(&self) -> usize {
        self.0.align()
    }

    fn base_addr(&self) -> usize {
        self.0.base_addr()
    }

    fn tcb_offset(&self) -> usize {
        self.0.tcb_offset()
    }

    unsafe fn copy_into(&self, dst: NonNull<u8>) -> Result<NonNull<u8>, TlsCopyError> {
        Err(TlsCopyError::AddressOverflow {
            addr: dst.as_ptr() as usize,
            align: self.0.align(),
        })
    }
}

/// A template that reports a TLS base `shift` bytes above the real one.
///
/// Relocation then lands the TCB `shift` bytes below the new TLS image.
pub struct ShiftedBase<'a> {
    pub process: &'a FakeProcess,
    pub shift: usize,
}

impl TlsTemplate for ShiftedBase<'_> {
    fn size(&self) -> usize {
        self.process.size()
    }

    fn align(&self) -> usize {
        self.process.align()
    }

    fn base_addr(&self) -> usize {
        self.process.base_addr() + self.shift
    }

    fn tcb_offset(&self) -> usize {
        TCB_OFFSET.wrapping_sub(self.shift)
    }

    unsafe fn copy_into(&self, dst: NonNull<u8>) -> Result<NonNull<u8>, TlsCopyError> {
        // SAFETY: Forwarded from the caller.
        unsafe { self.process.copy_into(dst) }
    }
}

/// [`GlobalHeap`] with call counters.
#[derive(Default)]
pub struct CountingAlloc {
    pub allocs: AtomicUsize,
    pub deallocs: AtomicUsize,
    pub last_size: AtomicUsize,
}

impl CountingAlloc {
    pub fn allocs(&self) -> usize {
        self.allocs.load(Ordering::SeqCst)
    }

    pub fn deallocs(&self) -> usize {
        self.deallocs.load(Ordering::SeqCst)
    }

    pub fn last_size(&self) -> usize {
        self.last_size.load(Ordering::SeqCst)
    }
}

// SAFETY: Forwards to `GlobalHeap`.
unsafe impl RegionAlloc for CountingAlloc {
    fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        self.allocs.fetch_add(1, Ordering::SeqCst);
        self.last_size.store(size, Ordering::SeqCst);
        GlobalHeap.alloc(size)
    }

    unsafe fn dealloc(&self, ptr: NonNull<u8>, size: usize) {
        self.deallocs.fetch_add(1, Ordering::SeqCst);
        // SAFETY: Forwarded from the caller.
        unsafe { GlobalHeap.dealloc(ptr, size) }
    }
}

/// An allocator that is always exhausted.
#[derive(Default)]
pub struct ExhaustedAlloc {
    pub calls: AtomicUsize,
}

// SAFETY: Never hands out memory.
unsafe impl RegionAlloc for ExhaustedAlloc {
    fn alloc(&self, _size: usize) -> Option<NonNull<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        None
    }

    unsafe fn dealloc(&self, _ptr: NonNull<u8>, _size: usize) {
        panic!("dealloc called on an allocator that never allocates");
    }
}

/// Releases a bootstrapped thread's region through `alloc`.
///
/// # Safety
///
/// `thread` must come from a bootstrap that used `alloc`, and must not be used
/// afterwards.
pub unsafe fn release<A: RegionAlloc>(alloc: &A, thread: NewThread) {
    // SAFETY: The TCB is initialized and describes the whole region.
    let (map_base, map_size) = unsafe {
        let tcb = thread.tcb.as_ref();
        (tcb.private.map_base, tcb.private.map_size)
    };
    let map_base = NonNull::new(map_base).expect("bootstrapped region is non-null");

    // SAFETY: Upheld by the caller.
    unsafe { alloc.dealloc(map_base, map_size) };
}
