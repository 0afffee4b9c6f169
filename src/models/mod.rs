//! Data models

mod credentials;
mod vm;

pub use credentials::*;
pub use vm::*;
