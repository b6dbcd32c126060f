//! Entry points from the trap stubs into the VM.

mod intr_handler;

pub use intr_handler::{inspect_handler, page_fault_handler, INSPECT_VECTOR};
