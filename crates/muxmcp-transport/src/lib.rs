//! # muxmcp-transport
//!
//! The three upstream transports the gateway multiplexes onto:
//!
//! - [`stdio::StdioSupervisor`] - a long-lived child process speaking
//!   newline-delimited JSON on stdin/stdout
//! - [`http::RemoteHttpTransport`] - one HTTP POST per JSON-RPC exchange
//! - [`streamable::StreamableHttpTransport`] - MCP streamable HTTP with
//!   SSE streaming and session resumption
//!
//! All three implement [`core::Transport`], the single seam the router
//! dispatches through.

pub mod config;
pub mod core;
pub mod error;
pub mod http;
pub mod sse;
pub mod stdio;
pub mod streamable;

pub use self::config::{ApiKeyLocation, HttpConfig, StdioConfig, StreamableConfig, UpstreamAuth};
pub use self::core::{EventStream, Exchange, ExchangeContext, StreamEvent, Transport};
pub use self::error::{TransportError, TransportResult};
