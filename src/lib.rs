#![doc = include_str!("../README.md")]

pub use grove_data as data;
pub use grove_protocol as protocol;
pub use grove_server as server;

pub use grove_server::{ChannelConfig, ChannelServer};
