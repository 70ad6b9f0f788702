/*! Specialized containers.

The `storage` module provides containers for use in other modules.
The containers support both pre-allocated memory, without the `std`
or `alloc` crates being available, and heap-allocated memory.
*/

mod slab;

pub use self::slab::{Handle, Slab, Slot};

/// Indicates that a requested allocation cannot be satisfied
/// because the container is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Full;

impl core::fmt::Display for Full {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "container is full")
    }
}

impl core::error::Error for Full {}
