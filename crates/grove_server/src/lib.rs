//! Channel core for the grove server.
//!
//! A channel accepts persistent client connections, hydrates each
//! connection's character from the store, and multiplexes the sessions onto
//! map instances ([`Room`]s). Every room is owned by exactly one [`Worker`]
//! (a single-threaded reactor); the authoritative per-map simulation lives
//! in [`Map`]. Global state is limited to the [`EventManager`], the
//! [`RoomThreadCoordinator`], and the login-disconnect set, each behind a
//! mutex.

pub mod character;
pub mod config;
pub mod controller;
pub mod coordinator;
pub mod db;
pub mod events;
pub mod map;
pub mod object;
pub mod packets;
pub mod persist;
pub mod room;
pub mod script;
pub mod server;
pub mod session;
pub mod user;
pub mod worker;

pub use config::ChannelConfig;
pub use coordinator::RoomThreadCoordinator;
pub use events::{EventKind, EventManager};
pub use map::Map;
pub use room::Room;
pub use server::ChannelServer;
pub use session::Session;
pub use worker::{ThreadPool, WorkerHandle};
