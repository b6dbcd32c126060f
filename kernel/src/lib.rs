#![cfg_attr(target_os = "none", no_std)]

pub mod block;
pub mod interrupts;
pub mod mem;
pub mod process;
pub mod swapping;
pub mod sync;
pub mod vfs;

extern crate alloc;

pub use mem::vm_error::VmError;
pub use mem::{vm, vm_init, EvictionPolicy, Vm, VmConfig, VmStats};
