//! gRPC call semantics (unary, client streaming, server streaming, duplex) over a single
//! raw byte-stream connection per call, without HTTP/2.
//!
//! ## Overview
//!
//! Every call opens its own TCP connection. The client sends a request envelope (method
//! name, headers, deadline) followed by length-prefixed frames, the server answers with
//! optional headers, response data and a final status. Calls can be cancelled from either
//! side: the client sends a best effort cancel notice, the server stops writing
//! immediately.
//!
//! Features:
//!
//! * [x] All four call shapes,
//! * [x] Request headers, response headers and trailers,
//! * [x] Deadlines, propagated to the server,
//! * [x] Client cancellation,
//! * [x] Pluggable payload marshalling (raw bytes, utf8, JSON behind the `json` feature),
//! * [ ] Multiplexing calls over one connection,
//! * [ ] TLS.
//!
//! ## Examples
//!
//! ```
//! use rawgrpc::client::Client;
//! use rawgrpc::config::ConfigBuilder;
//! use rawgrpc::handler::{HandlerRegistry, HandlerResult, UnaryHandler};
//! use rawgrpc::messages::raw;
//! use rawgrpc::method::{CallOptions, Method, MethodType};
//! use rawgrpc::server::context::ServerCallContext;
//! use rawgrpc::server::Server;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let method = Method::new(MethodType::Unary, "/echo.Echo/Say", raw::utf8(), raw::utf8());
//!
//!     // Server
//!     let registry = Arc::new(HandlerRegistry::new());
//!     registry.register_unary(&method, Echo).await?;
//!     let config = ConfigBuilder::default().server_address("127.0.0.1:0".parse()?).build()?;
//!     let server = Server::new(config.clone(), registry);
//!     let address = server.start().await?;
//!
//!     // Client
//!     let client = Client::new(address, config)?;
//!     let call = client.unary_call(&method, CallOptions::new(), &"hello".to_owned());
//!     assert_eq!("hello", call.response().await?);
//!
//!     server.shutdown().await;
//!     Ok(())
//! }
//!
//! #[derive(Debug)]
//! struct Echo;
//!
//! #[async_trait::async_trait]
//! impl UnaryHandler for Echo {
//!     type REQ = String;
//!     type RES = String;
//!     async fn handle(&self, request: String, _context: &ServerCallContext) -> HandlerResult<String> {
//!         Ok(request)
//!     }
//! }
//! ```

#[macro_use]
extern crate getset;
#[macro_use]
extern crate num_derive;
#[macro_use]
extern crate derive_builder;
#[macro_use]
extern crate derive_new;
#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate log;

pub mod cancellation;
pub mod client;
pub mod config;
pub mod connection;
pub mod errors;
pub mod frames;
pub mod handler;
pub mod messages;
pub mod metadata;
pub mod method;
pub(crate) mod queue;
pub mod server;
pub(crate) mod signal;
pub mod status;

pub use crate::client::Client;
pub use crate::config::Config;
pub use crate::errors::{RpcError, RpcResult};
pub use crate::metadata::Metadata;
pub use crate::server::Server;
pub use crate::status::{Code, Status};
