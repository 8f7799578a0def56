//! GPU completion tracking.
//!
//! A [`Fence`] marks a point in a command stream. Fences of one class
//! complete in creation order, so when the [`FenceManager`] learns that a
//! fence has signaled it marks every older fence of the class signaled too,
//! without asking the kernel about each one.

mod backend;
mod error;
mod manager;

pub use backend::{DriverFences, FenceBackend};
pub use error::FenceError;
pub use manager::{Fence, FenceManager};
