//! Thread bootstrap for WASI threads.
//!
//! Builds the memory a new thread starts on: one allocation carved into a stack,
//! a copy of the TLS image (with the thread's TCB inside it) and a TSD table.
//! The host's `thread-spawn` import is handed the resulting TLS base and stack
//! pointer; spawning itself happens elsewhere.

#![cfg_attr(not(test), no_std)]

// The `alloc` crate backs the `GlobalHeap` region allocator.
extern crate alloc;

mod create;
mod layout;
mod region_alloc;

pub use create::*;
pub use layout::*;
pub use region_alloc::*;
pub use wasi_sys_tls as tls;

#[cfg(feature = "ffi")]
pub mod ffi;
