//! An asynchronous micro RPC library
//!
//! This crate models every client call and every server handler with the
//! same atomic abstraction: a [`Service`], a pure asynchronous function from
//! [`Request`] to [`Response`]. Cross-cutting behaviour (structured error
//! propagation, deadlines, h2c upgrades, routing) is layered on with
//! [`Filter`]s, which transform one service into another.
//!
//! # Features
//!
//! - Services as values: compose, wrap, and pass them around
//! - One error envelope on the wire: structured errors round-trip between
//!   processes with code, message and params intact
//! - Context-driven cancellation coupled to response-body lifetime
//! - Buffered and streaming bodies under one type, with chunked streaming
//!   responses flushed per write
//! - A method+path router with parameter capture and catch-alls
//! - HTTP/1.1 and HTTP/2 (prior-knowledge or upgrade-style h2c) serving
//! - Graceful shutdown with stop/kill windows
//!
//! # Example
//!
//! ```no_run
//! use micro_rpc::filters::ErrorFilter;
//! use micro_rpc::{service_fn, Request, Router, ServiceExt};
//!
//! #[tokio::main]
//! async fn main() {
//!     let router = Router::new();
//!     router
//!         .get("/greet/:name", service_fn(|req: Request| async move {
//!             let name = req.param("name").unwrap_or("world").to_string();
//!             req.response_with(&format!("hello, {name}"))
//!         }))
//!         .expect("valid route");
//!
//!     let server = micro_rpc::listen(router.filter(ErrorFilter), None).await.expect("bind");
//!     println!("listening on {}", server.url());
//!
//!     let mut rsp = Request::get(&format!("{}/greet/rust", server.url())).send().await;
//!     let greeting: String = rsp.decode().await.expect("decode");
//!     assert_eq!(greeting, "hello, rust");
//!
//!     server.stop().await;
//! }
//! ```
//!
//! # Architecture
//!
//! - [`service`]: the Service/Filter algebra
//! - [`Request`] / [`Response`]: the value model, with buffered and
//!   streaming bodies
//! - [`client`]: the send pipeline, from pooled transport to response
//!   futures and body/cancellation coupling
//! - [`server`]: binding services to sockets with graceful shutdown
//! - [`filters`]: error propagation, timeouts, expiration, h2c
//! - [`Router`]: method+path dispatch

mod body;
mod context;
mod request;
mod response;
mod router;
mod streamer;

pub mod client;
pub mod error;
pub mod filters;
pub mod server;
pub mod service;

pub use body::{Body, BodyError};
pub use client::{client, send, send_via, set_client, ResponseFuture};
pub use context::Context;
pub use error::ServiceError;
pub use request::{Request, RequestHead};
pub use response::{Response, ResponseWriter};
pub use router::{RouteError, Router};
pub use server::{listen, serve, Server};
pub use service::{filter_fn, service_fn, ArcService, Filter, Service, ServiceExt};
pub use streamer::{StreamWriter, Streamer};
