#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod hash;
pub mod mem;
pub mod paging;
pub mod sizes;
