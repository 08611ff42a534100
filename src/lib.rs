//! # proxybench
//!
//! A micro-benchmark racing two proxied HTTP/1.1 client stacks.
//!
//! `proxybench` stands up an in-process origin server and an
//! authenticating forward proxy, then drives two deliberately different
//! client implementations through the proxy: a dispatcher that pools
//! hyper connections, and an agent that pools raw sockets and speaks
//! HTTP/1.1 by hand. Each client runs a strictly sequential request loop
//! and reports how long the loop took.
//!
//! ## Features
//!
//! - **Ephemeral fixtures**: origin and proxy bind port 0, so runs never collide
//! - **Proxy auth**: Basic credentials checked on every request, 407 otherwise
//! - **CONNECT tunnels**: https targets tunnel, http targets use absolute-form
//! - **Two pooling disciplines**: FIFO hyper connections vs LIFO raw sockets
//! - **Deterministic teardown**: one context owns servers, pools, and shutdown
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use proxybench::base::context::BenchContext;
//!
//! #[tokio::main]
//! async fn main() {
//!     let ctx = BenchContext::start("username", "password").await.unwrap();
//!     let report = ctx.run(10_000).await.unwrap();
//!     print!("{report}");
//!     ctx.shutdown();
//! }
//! ```
//!
//! ## Modules
//!
//! - [`base`] - Error codes and the benchmark context
//! - [`socket`] - Connection establishment, proxy settings, socket pooling
//! - [`server`] - In-process origin and forward proxy fixtures
//! - [`client`] - The two client stacks under measurement
//! - [`driver`] - Sequential request loops and the timing report

pub mod base;
pub mod client;
pub mod driver;
pub mod server;
pub mod socket;
