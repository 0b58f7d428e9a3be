pub mod api;
pub mod config;
pub mod error;
pub mod logging;
pub mod model;
pub mod reconcile;
pub mod render;
pub mod slug;
pub mod sync;
pub mod timestamp;

pub use error::unpack_error;
