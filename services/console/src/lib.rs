pub mod alerts;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod health;
pub mod profile;
pub mod session;
pub mod snapshot;
pub mod store;

pub use connection::{ConnectionManager, ConnectionState};
pub use dispatch::{EventDispatcher, Topic};
pub use session::build_authenticated_request;
pub use store::{Domain, ReconciliationStore};
