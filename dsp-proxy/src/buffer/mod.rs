//! Fixed-capacity buffer pools in shared memory.
//!
//! A [`BufferPool`] is created with a [`PoolRole`] and a `(count, item_size)`
//! geometry and never grows or shrinks. [`Buffer`] is the exclusive handle to
//! one checked-out item; dropping it returns the item.

pub mod pool;
pub mod handle;

pub use handle::Buffer;
pub use pool::{BufferPool, PoolRole};
