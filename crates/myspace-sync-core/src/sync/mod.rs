//! Authenticated sync sessions over framed WebSocket streams

mod manager;
mod protocol;
mod session;

pub use manager::{SyncDataCallback, SyncManager};
pub use protocol::{MessageType, SyncData, SyncMessage, SyncOp};
pub use session::Session;
