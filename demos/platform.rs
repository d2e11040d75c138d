//! Minimal platform - answers terminals the way a dispatch center would.
//!
//! This example demonstrates:
//! - Loading a [`ServerConfig`] from an optional JSON file
//! - Serving TCP and UDP terminals from one handler
//! - Registration, authentication and general responses
//!
//! # Running
//!
//! ```text
//! RUST_LOG=debug cargo run --example platform -- platform.json
//! ```
//!
//! Without a config file it listens on `0.0.0.0:6808` for both transports.

use bytes::Bytes;
use jt808_core::message::{ids, register_result, response_result, RegisterResponse};
use jt808_core::{Body, Message, Server, ServerConfig, SessionContext};
use tracing_subscriber::EnvFilter;

async fn on_message(ctx: SessionContext, message: Message) -> jt808_core::Result<()> {
    match &message.body {
        Body::Register(register) => {
            tracing::info!(
                "Register from {}: model {}, terminal {}",
                message.device_id(),
                register.model,
                register.terminal_id
            );
            // Token is the device id; a real platform would issue its own.
            let token = Bytes::copy_from_slice(message.device_id().as_str().as_bytes());
            let response = RegisterResponse {
                reply_serial: message.serial_number(),
                result: register_result::SUCCESS,
                token,
            };
            ctx.reply_body(&message.header, response).await?;
        }
        Body::Authentication(auth) => {
            let accepted = auth.token.as_ref() == message.device_id().as_str().as_bytes();
            ctx.set_authenticated(accepted)?;
            let result = if accepted {
                response_result::SUCCESS
            } else {
                response_result::FAILURE
            };
            tracing::info!("Auth from {}: accepted={}", message.device_id(), accepted);
            ctx.general_response(&message.header, result).await?;
        }
        Body::TerminalResponse(_) => {}
        _ if message.message_id() & 0x8000 != 0 => {
            tracing::debug!("Ignoring platform message {:#06x}", message.message_id());
        }
        _ => {
            let result = if message.message_id() == ids::HEARTBEAT || ctx.session().is_authenticated() {
                response_result::SUCCESS
            } else {
                response_result::FAILURE
            };
            ctx.general_response(&message.header, result).await?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => ServerConfig::from_json_file(path)?,
        None => ServerConfig {
            tcp_bind: Some("0.0.0.0:6808".parse()?),
            udp_bind: Some("0.0.0.0:6808".parse()?),
            ..ServerConfig::default()
        },
    };

    let server = Server::builder()
        .config(config)
        .handler(jt808_core::handler_fn(on_message))
        .start()
        .await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down with {} sessions", server.sessions().len());
    server.shutdown().await;

    Ok(())
}
