//! # jt808-core
//!
//! Platform-side core of the JT/T 808 vehicle terminal protocol.
//!
//! ## Layers
//!
//! - **Wire** ([`protocol`]): `0x7E` delimited frames with byte stuffing and
//!   XOR checksum, the variable-length header (2013 and 2019 layouts), BCD
//!   device ids kept digit-exact
//! - **Messages** ([`message`], [`codec`]): a registry mapping message ids to
//!   body codecs; unknown ids decode to an opaque body
//! - **Reassembly** ([`fragment`]): sub-packages joined by index with a
//!   timeout for groups that never complete
//! - **Sessions** ([`session`]): one per TCP connection or UDP terminal,
//!   indexed by session id and by bound device id
//! - **Serving** ([`server`]): TCP and UDP loops feeding a
//!   [`MessageHandler`](handler::MessageHandler)
//!
//! ## Example
//!
//! ```ignore
//! use jt808_core::handler::{handler_fn, HandlerResult};
//! use jt808_core::message::response_result;
//! use jt808_core::Server;
//!
//! #[tokio::main]
//! async fn main() -> jt808_core::Result<()> {
//!     let server = Server::builder()
//!         .tcp_bind("0.0.0.0:6808".parse().unwrap())
//!         .udp_bind("0.0.0.0:6808".parse().unwrap())
//!         .handler(handler_fn(|ctx, message| async move {
//!             ctx.general_response(&message.header, response_result::SUCCESS).await?;
//!             HandlerResult::Ok(())
//!         }))
//!         .start()
//!         .await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     server.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod fragment;
pub mod handler;
pub mod message;
pub mod protocol;
pub mod server;
pub mod session;
pub mod transport;
pub mod writer;

pub use codec::MessageRegistry;
pub use config::ServerConfig;
pub use error::{Jt808Error, Result};
pub use handler::{handler_fn, MessageHandler, SessionContext};
pub use message::{Body, Message};
pub use server::{Server, ServerBuilder};
pub use session::{Session, SessionId, SessionTable};
