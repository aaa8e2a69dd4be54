//! # Thread-Local Storage (TLS) and Thread Control Block for WASI threads
//!
//! This crate provides the foundational types for bootstrapping a thread under the
//! `wasi-threads` proposal: the Thread Control Block (TCB) layout shared with the C
//! runtime, and an abstraction over the module's TLS template.
//!
//! ## WebAssembly Thread-Local Storage Architecture
//!
//! ### Overview
//!
//! WebAssembly has no thread pointer register. A module compiled with shared memory
//! instead gets three linker-synthesized globals and one linker-synthesized function:
//!
//! | Symbol              | Kind                  | Meaning                                    |
//! |---------------------|-----------------------|--------------------------------------------|
//! | `__tls_size`        | immutable `i32` global| Size in bytes of the TLS image             |
//! | `__tls_align`       | immutable `i32` global| Alignment the TLS image requires           |
//! | `__tls_base`        | mutable `i32` global  | Base of the *current* thread's TLS block   |
//! | `__wasm_init_tls`   | function              | Copies `.tdata` and sets `__tls_base`      |
//!
//! Each wasm instance (one per thread) has its own copy of the `__tls_base` global.
//! Every `_Thread_local` variable is addressed as `__tls_base + <link-time offset>`.
//!
//! ### Where the TCB lives
//!
//! The C runtime declares its thread control block as a thread-local variable:
//!
//! ```text
//! extern _Thread_local struct pthread __wasilibc_pthread_self;
//! ```
//!
//! so the TCB is *inside* the TLS block, at a fixed offset from `__tls_base`:
//!
//! ```text
//! __tls_base
//! ┌──────────────────────────────┐
//! │ .tdata / .tbss               │
//! │   ...                        │
//! │ ┌──────────────────────────┐ │ ← __tls_base + tcb_offset
//! │ │ struct pthread (TCB)     │ │
//! │ └──────────────────────────┘ │
//! │   ...                        │
//! └──────────────────────────────┘ ← __tls_base + __tls_size
//! ```
//!
//! The offset is fixed at link time and identical for every thread, which is what
//! makes relocation work: if a new TLS block is placed `delta` bytes away from the
//! current one, the new TCB is exactly `delta` bytes away from the current TCB.
//! See [`relocate()`].
//!
//! ### Thread creation
//!
//! A new thread is handed a TLS base and a stack pointer by its creator. The creator
//! allocates both, copies the TLS template into the new block and initializes the
//! new TCB *before* the host spawns the thread. The layout algorithm lives in the
//! `wasi-sys-thread` crate; this crate only defines what is being laid out.
//!
//! ## References
//!
//! - [WebAssembly Threads proposal](https://github.com/WebAssembly/threads)
//! - [wasi-threads](https://github.com/WebAssembly/wasi-threads)
//! - [LLVM: `__wasm_init_tls`](https://github.com/llvm/llvm-project/blob/main/lld/wasm/Writer.cpp)
//! - [ELF Handling For Thread-Local Storage](https://www.akkadia.org/drepper/tls.pdf)

#![cfg_attr(not(test), no_std)]
#![cfg_attr(target_arch = "wasm32", feature(asm_experimental_arch))]

mod tcb;
mod template;

#[cfg(target_arch = "wasm32")]
pub mod wasm;

pub use tcb::*;
pub use template::*;
