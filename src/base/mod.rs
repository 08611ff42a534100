//! Base types and error handling.
//!
//! - [`NetError`]: network error codes shared by every layer
//! - [`BenchContext`]: one value owning servers, clients, and teardown
//!
//! [`NetError`]: neterror::NetError
//! [`BenchContext`]: context::BenchContext

pub mod context;
pub mod neterror;
