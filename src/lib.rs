//! # pipehttp
//!
//! An embeddable async HTTP/1.1 connection engine.
//!
//! Each connection is read by a single loop that assembles requests and decodes
//! their bodies (content-length, chunked, gzip, url-encoded and multipart
//! forms). Requests are handled concurrently; a per-connection sequencer
//! writes responses strictly in request order, so pipelining clients always
//! see answers in the order they asked.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pipehttp::{Registry, Response, Server, StatusCode};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut registry = Registry::new();
//!     registry.get("/", |_ctx| async { Response::new(StatusCode::Ok).body("Hello, World!") });
//!
//!     let server = Server::bind("127.0.0.1:8080").await?;
//!     println!("Listening on http://{}", server.local_addr());
//!     server.run(registry).await?;
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod context;
pub mod error;
pub mod http;
pub mod router;
pub mod server;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use codec::Content;
pub use config::ServerConfig;
pub use context::Context;
pub use error::ConnectionError;
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use router::Registry;
pub use server::{Server, ServerError};
