//! Lock-free building blocks shared by the page cache and its clients.

mod id_queue;

pub use id_queue::{BoundedIdQueue, NO_ID};
