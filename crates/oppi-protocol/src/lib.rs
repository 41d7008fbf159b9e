//! Wire protocol for the oppi agent session client.
//!
//! Messages are JSON objects discriminated by a `type` field. Inbound
//! (server -> client) messages decode into [`ServerMessage`], outbound
//! (client -> server) messages are built from [`ClientMessage`].
//!
//! Decoding is discriminator-first: unknown `type` tags decode to
//! [`ServerMessage::Unknown`] so newer servers never break older clients,
//! while a known tag with missing required fields is a hard error.

pub mod client;
pub mod codec;
pub mod server;
pub mod trace;
pub mod types;

pub use client::ClientMessage;
pub use codec::{DecodeError, EncodeError, decode, decode_value, encode};
pub use server::ServerMessage;
pub use trace::{AssistantBlock, TraceEvent, TraceEventKind};
pub use types::{
    AckStage, ImageAttachment, PermissionAction, SessionInfo, SessionStatus, SubscriptionLevel,
    Usage, WorkspaceInfo,
};
