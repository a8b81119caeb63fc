pub mod backend;
pub mod bindings;
pub mod claim;
pub mod codec;
pub mod config;
pub mod device;
pub mod endian;
pub mod error;
pub mod proto;
pub mod server;
pub mod session;
pub mod tracker;

pub use endian::{BeU16, BeU32, BeU64};
pub use error::{Error, Result};
pub use server::{Server, ServerStatus};
