//! Analysis results: storage, serving and querying.
//!
//! The analysis session writes one [`ResultEntry`] per volume into a shared
//! [`ResultsStore`]; the [`ResultsServer`] answers queries from it while the
//! session is still running. The store can be snapshotted to JSON at the end
//! of a session.

pub mod client;
pub mod server;
pub mod store;

pub use client::ResultsClient;
pub use server::{ResultsServer, ResultsServerHandle};
pub use store::{ResultEntry, ResultsStore, FOUND_KEY};
