pub mod lifecycle;
mod session;

pub use lifecycle::{
    ConnectionEvent, ConnectionManager, DEFAULT_RECONNECT_DELAY, LifecycleSettings, parse_port,
    select_peer,
};
pub use session::READ_CHUNK_SIZE;
