//! DUET Environment Abstraction Layer
//!
//! This crate provides the "Sans-IO" seam that lets the result-sync core run
//! against a **Production** broker (STOMP over WebSocket, tokio clock) or a
//! **Simulation** harness (in-memory broker, virtual clock).
//!
//! # Core Concept
//!
//! The core never touches sockets or wall clocks directly. It goes through:
//! - Time (`now()`, `sleep()`) via [`DuetContext`]
//! - Messaging (`connect()`, `subscribe()`, `recv()`, `send()`) via [`MessageTransport`]
//!
//! # Example
//!
//! ```ignore
//! use duet_env::{DuetContext, MessageTransport};
//!
//! async fn pump<Ctx: DuetContext, T: MessageTransport>(ctx: &Ctx, transport: &T) {
//!     transport.connect().await?;
//!     transport.subscribe("/topic/noise-results").await?;
//!     loop {
//!         let message = transport.recv().await?;
//!         handle(message);
//!     }
//! }
//! ```

mod context;
mod error;
pub mod stomp;
mod tokio_impl;
mod transport;
mod types;

#[cfg(feature = "stomp")]
mod ws;

pub use context::DuetContext;
pub use error::EnvError;
pub use tokio_impl::TokioContext;
pub use transport::MessageTransport;
pub use types::{ClientId, InboundMessage};

#[cfg(feature = "stomp")]
pub use ws::StompWsTransport;
