//! State stores shared by the router and the timeline.

pub mod extension_ui;
pub mod permissions;
pub mod session;
pub mod sync_cache;
pub mod tool_args;
pub mod tool_output;

pub use extension_ui::{ExtensionDialog, ExtensionDialogStore};
pub use permissions::{PendingPermission, PermissionStore};
pub use session::{Session, SessionStore};
pub use sync_cache::{SyncCache, SyncResource};
pub use tool_args::ToolArgsStore;
pub use tool_output::ToolOutputStore;
