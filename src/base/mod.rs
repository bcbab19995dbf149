//! Small building blocks shared by the fiber, I/O and RPC layers.

pub mod id_alloc;
pub mod object_pool;
pub mod oneshot;
