//! In-process HTTP/1.1 servers the benchmark drives traffic through.
//!
//! - [`origin`]: the origin every request ultimately lands on
//! - [`proxy`]: the authenticating forward proxy in front of it

pub mod origin;
pub mod proxy;
