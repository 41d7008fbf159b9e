//! Resumable agent session client.
//!
//! Keeps a live conversation with a remote agent runtime over a connection
//! that drops and resumes, and turns the event stream plus server-side
//! history into one ordered timeline.
//!
//! Data flow: [`transport`] -> [`router::spawn_inbound_pump`] (eager ack
//! observation) -> [`router::Connection`] -> {[`command`], [`timeline`],
//! [`stores`]}.

pub mod command;
pub mod config;
pub mod error;
pub mod logging;
pub mod router;
pub mod sources;
pub mod stores;
pub mod timeline;
pub mod transport;

pub use command::{ACK_SUFFICIENT_STAGE, CommandEngine, CommandSettings, ProgressFn};
pub use config::ClientConfig;
pub use error::{CommandError, CommandResult, ForkError, TransportError};
pub use router::{
    Connection, DialogAnswer, RouteClass, RouterSettings, TurnKind, route, spawn_inbound_pump,
};
pub use sources::{CredentialsProvider, StaticCredentials, SyncSource, ToolOutputSource};
pub use timeline::{ReconcilePlan, TimelineItem, TimelineLimits, TimelineReducer};
pub use transport::{ConnectionStatus, Transport, WsSettings, WsTransport};
