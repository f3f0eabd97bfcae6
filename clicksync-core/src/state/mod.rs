pub mod connection;

pub use connection::{ConnectionStatus, FailureKind, FailureReason, StatusEvent, StatusMachine};
