//! Peer-to-peer synchronization node for laboratory data.
//!
//! Lab sites, field collection sites and the central server each run one of
//! these nodes. Records live in two append-only multi-writer logs (`lab`
//! for samples, plates and results; `admin` for user accounts) which
//! replicate over mutually authenticated TLS according to a per-peer-type
//! permission matrix. Queries go through incrementally maintained index
//! views that resolve conflicting revisions by last write wins.

pub mod config;
pub mod engine;
pub mod entry;
pub mod log;
pub mod net;
pub mod node;
pub mod peers;
pub mod reconnect;
pub mod store;
pub mod tls;
pub mod validate;
pub mod views;

pub use config::Config;
pub use node::{Node, Views};
