//! Handler module - where decoded messages leave the core.
//!
//! Provides:
//! - [`MessageHandler`] - receives every decoded message with its session
//! - [`SessionContext`] - lets a handler reply, bind state, or close
//! - [`handler_fn`] - adapter turning an async closure into a handler
//!
//! # Example
//!
//! ```
//! use jt808_core::handler::{handler_fn, HandlerResult, SessionContext};
//! use jt808_core::message::{ids, response_result, Message};
//!
//! let handler = handler_fn(|ctx: SessionContext, message: Message| async move {
//!     if message.message_id() == ids::HEARTBEAT {
//!         ctx.general_response(&message.header, response_result::SUCCESS).await?;
//!     }
//!     HandlerResult::Ok(())
//! });
//! # let _ = handler;
//! ```

mod context;

use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;

use crate::error::Result;
use crate::message::Message;

pub use context::SessionContext;

/// Result type for handler functions.
pub type HandlerResult = Result<()>;

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Consumer of decoded messages.
///
/// Called once per complete message, in arrival order per TCP connection.
/// Errors are logged by the dispatcher and never close the connection.
pub trait MessageHandler: Send + Sync + 'static {
    fn on_message(&self, ctx: SessionContext, message: Message) -> BoxFuture<'static, HandlerResult>;
}

/// [`MessageHandler`] backed by an async closure.
pub struct FnHandler<F, Fut>
where
    F: Fn(SessionContext, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    handler: F,
    _phantom: PhantomData<fn() -> Fut>,
}

impl<F, Fut> MessageHandler for FnHandler<F, Fut>
where
    F: Fn(SessionContext, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn on_message(&self, ctx: SessionContext, message: Message) -> BoxFuture<'static, HandlerResult> {
        Box::pin((self.handler)(ctx, message))
    }
}

/// Wrap an async closure as a [`MessageHandler`].
pub fn handler_fn<F, Fut>(handler: F) -> FnHandler<F, Fut>
where
    F: Fn(SessionContext, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    FnHandler {
        handler,
        _phantom: PhantomData,
    }
}
