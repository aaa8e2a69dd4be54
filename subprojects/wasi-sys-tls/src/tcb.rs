//! Thread Control Block (TCB)
//!
//! The TCB is the C runtime's `struct pthread`. It is split in two parts:
//!
//! - [`TcbAbi`]: fields whose offsets are part of the external ABI. They are read
//!   by code we do not control (compiler-emitted stack protector loads, the C
//!   runtime's `pthread_self()` users) and **must not** be reordered.
//! - [`TcbPrivate`]: runtime bookkeeping. Its layout is ours to choose.
//!
//! ```text
//! Pthread
//! 0x00  ┌────────────────────────────┐  ╮
//!       │ self_ptr   (*mut Pthread)  │  │
//! 1w    ├────────────────────────────┤  │
//!       │ prev       (*mut Pthread)  │  │
//! 2w    ├────────────────────────────┤  ├ TcbAbi (5 words)
//!       │ next       (*mut Pthread)  │  │
//! 3w    ├────────────────────────────┤  │
//!       │ sysinfo    (usize)         │  │
//! 4w    ├────────────────────────────┤  │
//!       │ canary     (usize)         │  │
//! 5w    ├────────────────────────────┤  ╯
//!       │ TcbPrivate                 │
//!       │   ...                      │
//!       └────────────────────────────┘
//! ```
//!
//! `w` is the pointer width: 4 bytes on `wasm32`, 8 bytes on 64-bit hosts.

use core::{
    ffi::{c_char, c_void},
    mem::offset_of,
    ptr::{self, NonNull},
    sync::atomic::{AtomicI32, AtomicPtr, AtomicU8, Ordering},
};

use bitflags::bitflags;
use static_assertions::const_assert_eq;

/// Maximum number of thread-specific data keys (`PTHREAD_KEYS_MAX`).
pub const PTHREAD_KEYS_MAX: usize = 128;

/// Size in bytes of the per-thread TSD slot table.
///
/// One pointer-sized slot per supported key.
pub const TSD_TABLE_SIZE: usize = PTHREAD_KEYS_MAX * size_of::<*mut c_void>();

/// Size of a machine word.
const WORD: usize = size_of::<usize>();

/// Size of the [`TcbAbi`] header in bytes.
pub const TCB_ABI_SIZE: usize = 5 * WORD;

/// Thread control block.
///
/// One per thread, embedded in that thread's TLS block.
#[derive(Debug)]
#[repr(C)]
pub struct Pthread {
    /// ABI-fixed header. Always at offset 0.
    pub abi: TcbAbi,

    /// Runtime bookkeeping.
    pub private: TcbPrivate,
}

// The ABI header must start the record and keep the C runtime's field order.
const_assert_eq!(offset_of!(Pthread, abi), 0);
const_assert_eq!(offset_of!(Pthread, private), TCB_ABI_SIZE);
const_assert_eq!(size_of::<TcbAbi>(), TCB_ABI_SIZE);
const_assert_eq!(offset_of!(TcbAbi, self_ptr), 0);
const_assert_eq!(offset_of!(TcbAbi, prev), WORD);
const_assert_eq!(offset_of!(TcbAbi, next), 2 * WORD);
const_assert_eq!(offset_of!(TcbAbi, sysinfo), 3 * WORD);
const_assert_eq!(offset_of!(TcbAbi, canary), 4 * WORD);

/// ABI-fixed part of the TCB.
///
/// The field order matches the first part of the C runtime's `struct pthread`.
#[derive(Debug)]
#[repr(C)]
pub struct TcbAbi {
    /// Pointer to the enclosing [`Pthread`]. Always points to itself.
    pub self_ptr: *mut Pthread,

    /// Previous thread in the runtime's thread list.
    pub prev: *mut Pthread,

    /// Next thread in the runtime's thread list.
    pub next: *mut Pthread,

    /// Platform-reserved system information word.
    pub sysinfo: usize,

    /// Stack-protector canary.
    pub canary: usize,
}

/// Private part of the TCB.
///
/// `#[repr(C)]` because the C runtime reads these fields through its own
/// `struct pthread` definition, but nothing outside this workspace depends on
/// a specific offset here.
#[derive(Debug)]
#[repr(C)]
pub struct TcbPrivate {
    /// Thread id.
    pub tid: i32,

    /// Per-thread `errno`.
    pub errno_val: i32,

    /// Raw [`DetachState`] value.
    pub detach_state: AtomicI32,

    /// Pending cancellation request.
    pub cancel: AtomicI32,

    /// Cancellation disabled (`PTHREAD_CANCEL_DISABLE`).
    pub cancel_disable: AtomicU8,

    /// Asynchronous cancellation enabled.
    pub cancel_async: AtomicU8,

    /// Single-bit flags.
    pub flags: TcbFlags,

    /// Base of the single allocation backing this thread.
    pub map_base: *mut u8,

    /// Size of the allocation at [`map_base`](Self::map_base).
    pub map_size: usize,

    /// Top of the usable stack (the stack grows down from here).
    pub stack: *mut c_void,

    /// Usable stack size, measured down from [`stack`](Self::stack).
    pub stack_size: usize,

    /// Guard region size below the stack.
    pub guard_size: usize,

    /// Exit result.
    pub result: *mut c_void,

    /// Cancellation cleanup buffer chain.
    pub cancel_buf: *mut c_void,

    /// Thread-specific data slot table, [`PTHREAD_KEYS_MAX`] entries.
    pub tsd: *mut *mut c_void,

    /// Robust mutex list.
    pub robust_list: RobustList,

    /// Per-thread `h_errno`.
    pub h_errno_val: i32,

    /// POSIX timer id for `SIGEV_THREAD` timers.
    pub timer_id: AtomicI32,

    /// Locale handle (`locale_t`).
    pub locale: *mut c_void,

    /// Lock held while the thread is being signalled.
    pub kill_lock: [AtomicI32; 1],

    /// `dlerror()` message buffer.
    pub dlerror_buf: *mut c_char,

    /// Stdio locks owned by this thread.
    pub stdio_locks: *mut c_void,
}

bitflags! {
    /// Bit flags stored in [`TcbPrivate::flags`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    #[repr(transparent)]
    pub struct TcbFlags: u8 {
        /// At least one TSD slot has been written.
        const TSD_USED = 1 << 0;
        /// A `dlerror()` message is pending.
        const DLERROR_FLAG = 1 << 1;
    }
}

/// Robust mutex list head.
///
/// An empty list is represented by `head` pointing at itself.
#[derive(Debug)]
#[repr(C)]
pub struct RobustList {
    /// First held robust mutex, or the address of this field when empty.
    pub head: AtomicPtr<c_void>,

    /// Offset of the futex word within a robust mutex.
    pub off: isize,

    /// Mutex currently being acquired or released.
    pub pending: AtomicPtr<c_void>,
}

const_assert_eq!(size_of::<RobustList>(), 3 * WORD);

/// Thread detach state.
///
/// Values match the C runtime's `DT_*` constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum DetachState {
    Exited = 0,
    Exiting = 1,
    Joinable = 2,
    Detached = 3,
}

impl DetachState {
    /// Converts a raw `DT_*` value.
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(Self::Exited),
            1 => Some(Self::Exiting),
            2 => Some(Self::Joinable),
            3 => Some(Self::Detached),
            _ => None,
        }
    }
}

impl Pthread {
    /// Returns the thread's detach state, or `None` if the stored value is unknown.
    pub fn detach_state(&self) -> Option<DetachState> {
        DetachState::from_raw(self.private.detach_state.load(Ordering::Acquire))
    }

    /// Returns `true` if the robust list is in its empty (self-referential) state.
    pub fn robust_list_is_empty(&self) -> bool {
        let head = &raw const self.private.robust_list.head;
        ptr::eq(
            self.private.robust_list.head.load(Ordering::Relaxed),
            head.cast::<c_void>(),
        )
    }
}

/// Values copied into a freshly bootstrapped TCB.
///
/// Everything the new thread needs to find its own memory later, plus the
/// values inherited from the creating thread.
#[derive(Debug, Clone, Copy)]
pub struct TcbInit {
    /// Base of the whole allocation.
    pub map_base: NonNull<u8>,

    /// Size of the whole allocation.
    pub map_size: usize,

    /// Top of the stack.
    pub stack: NonNull<u8>,

    /// Stack size, measured down from `stack`.
    pub stack_size: usize,

    /// TSD slot table.
    pub tsd: NonNull<*mut c_void>,

    /// Canary inherited from the creating thread.
    pub canary: usize,

    /// `sysinfo` inherited from the creating thread.
    pub sysinfo: usize,
}

/// Reads the `canary` and `sysinfo` words of a TCB, in that order.
///
/// # Safety
///
/// `tcb` must point to a live, initialized [`Pthread`].
#[inline]
pub unsafe fn inherited_words(tcb: NonNull<Pthread>) -> (usize, usize) {
    let tcb = tcb.as_ptr();

    // SAFETY: The caller guarantees `tcb` points to a live TCB. Volatile reads
    // keep the compiler from caching values another thread may be publishing.
    unsafe {
        (
            ptr::read_volatile(&raw const (*tcb).abi.canary),
            ptr::read_volatile(&raw const (*tcb).abi.sysinfo),
        )
    }
}

/// Initializes a TCB for a thread created by the bootstrap path.
///
/// Every field not described by `init` is zeroed, `guard_size` is 0, the detach
/// state is [`DetachState::Detached`], `self_ptr` points at `tcb` and the robust
/// list head points at itself.
///
/// # Safety
///
/// - `tcb` must be valid for writes of `size_of::<Pthread>()` bytes and suitably
///   aligned.
/// - No other thread may access the TCB while it is being initialized.
pub unsafe fn init_bootstrap(tcb: NonNull<Pthread>, init: TcbInit) {
    let this = tcb.as_ptr();

    // SAFETY: The caller guarantees `tcb` is valid for writes and not shared yet.
    unsafe {
        this.write(Pthread {
            abi: TcbAbi {
                self_ptr: this,
                prev: ptr::null_mut(),
                next: ptr::null_mut(),
                sysinfo: init.sysinfo,
                canary: init.canary,
            },
            private: TcbPrivate {
                tid: 0,
                errno_val: 0,
                detach_state: AtomicI32::new(DetachState::Detached as i32),
                cancel: AtomicI32::new(0),
                cancel_disable: AtomicU8::new(0),
                cancel_async: AtomicU8::new(0),
                flags: TcbFlags::empty(),
                map_base: init.map_base.as_ptr(),
                map_size: init.map_size,
                stack: init.stack.as_ptr().cast(),
                stack_size: init.stack_size,
                guard_size: 0,
                result: ptr::null_mut(),
                cancel_buf: ptr::null_mut(),
                tsd: init.tsd.as_ptr(),
                robust_list: RobustList {
                    head: AtomicPtr::new(ptr::null_mut()),
                    off: 0,
                    pending: AtomicPtr::new(ptr::null_mut()),
                },
                h_errno_val: 0,
                timer_id: AtomicI32::new(0),
                locale: ptr::null_mut(),
                kill_lock: [AtomicI32::new(0)],
                dlerror_buf: ptr::null_mut(),
                stdio_locks: ptr::null_mut(),
            },
        });

        // The sentinel needs the field's final address.
        let head = &raw mut (*this).private.robust_list.head;
        (*head).store(head.cast(), Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use core::mem::MaybeUninit;

    use super::*;

    fn sample_init(region: &mut [u8]) -> TcbInit {
        let base = NonNull::new(region.as_mut_ptr()).expect("slice pointer is never null");
        let len = region.len();
        TcbInit {
            map_base: base,
            map_size: len,
            // SAFETY: Both offsets are within `region`.
            stack: unsafe { base.add(len / 2) },
            stack_size: len / 2,
            tsd: unsafe { base.add(len - TSD_TABLE_SIZE).cast() },
            canary: 0x5EED_CAFE,
            sysinfo: 0x0051_5100,
        }
    }

    #[test]
    fn abi_header_layout_is_pinned() {
        assert_eq!(offset_of!(Pthread, abi), 0);
        assert_eq!(offset_of!(TcbAbi, self_ptr), 0);
        assert_eq!(offset_of!(TcbAbi, prev), size_of::<usize>());
        assert_eq!(offset_of!(TcbAbi, next), 2 * size_of::<usize>());
        assert_eq!(offset_of!(TcbAbi, sysinfo), 3 * size_of::<usize>());
        assert_eq!(offset_of!(TcbAbi, canary), 4 * size_of::<usize>());
        assert_eq!(offset_of!(Pthread, private), TCB_ABI_SIZE);
    }

    #[test]
    fn tsd_table_holds_one_slot_per_key() {
        assert_eq!(TSD_TABLE_SIZE, 128 * size_of::<*mut c_void>());
    }

    #[test]
    fn detach_state_round_trips_raw_values() {
        for state in [
            DetachState::Exited,
            DetachState::Exiting,
            DetachState::Joinable,
            DetachState::Detached,
        ] {
            assert_eq!(DetachState::from_raw(state as i32), Some(state));
        }
        assert_eq!(DetachState::from_raw(4), None);
        assert_eq!(DetachState::from_raw(-1), None);
    }

    #[test]
    fn init_bootstrap_sets_self_references() {
        let mut region = vec![0u8; 4096];
        let init = sample_init(&mut region);

        let mut slot = Box::new(MaybeUninit::<Pthread>::uninit());
        let tcb = NonNull::from(&mut *slot).cast::<Pthread>();

        // SAFETY: `slot` is a valid, aligned, unshared allocation for one `Pthread`.
        unsafe { init_bootstrap(tcb, init) };
        // SAFETY: Fully initialized by `init_bootstrap`.
        let pthread = unsafe { tcb.as_ref() };

        assert_eq!(pthread.abi.self_ptr, tcb.as_ptr());
        assert!(pthread.robust_list_is_empty());
        assert_eq!(
            pthread.private.robust_list.head.load(Ordering::Relaxed) as usize,
            &raw const pthread.private.robust_list.head as usize
        );
        assert!(pthread.abi.prev.is_null());
        assert!(pthread.abi.next.is_null());
    }

    #[test]
    fn init_bootstrap_records_region_and_inherited_words() {
        let mut region = vec![0u8; 4096];
        let init = sample_init(&mut region);

        let mut slot = Box::new(MaybeUninit::<Pthread>::uninit());
        let tcb = NonNull::from(&mut *slot).cast::<Pthread>();

        // SAFETY: `slot` is a valid, aligned, unshared allocation for one `Pthread`.
        unsafe { init_bootstrap(tcb, init) };
        // SAFETY: Fully initialized by `init_bootstrap`.
        let pthread = unsafe { tcb.as_ref() };

        assert_eq!(pthread.private.map_base, init.map_base.as_ptr());
        assert_eq!(pthread.private.map_size, init.map_size);
        assert_eq!(pthread.private.stack, init.stack.as_ptr().cast());
        assert_eq!(pthread.private.stack_size, init.stack_size);
        assert_eq!(pthread.private.guard_size, 0);
        assert_eq!(pthread.private.tsd, init.tsd.as_ptr());
        assert_eq!(pthread.detach_state(), Some(DetachState::Detached));
        assert_eq!(pthread.private.flags, TcbFlags::empty());

        // SAFETY: `tcb` is initialized.
        let (canary, sysinfo) = unsafe { inherited_words(tcb) };
        assert_eq!(canary, 0x5EED_CAFE);
        assert_eq!(sysinfo, 0x0051_5100);
    }
}
