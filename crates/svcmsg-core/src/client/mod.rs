//! Client side of the substrate.

pub mod connection;
pub mod msg_id;

pub use connection::{ConnectOptions, Connection, Response};
pub use msg_id::MsgIdGenerator;
