//! Chat relay and shared path-addressed documents for game-world clients.
//!
//! ```text
//! ┌──────────┐    ┌─────────────┐    ┌──────────────┐
//! │   http   │───►│   service   │───►│  chat (log)  │
//! │ (tokio)  │    │ (Relay)     │    └──────────────┘
//! └──────────┘    │  limiter    │    ┌──────────────┐     ┌─────────────┐
//!                 │             │───►│ doc (store)  │────►│  replicate  │
//!                 └─────────────┘    │ + flushers   │     │  (GitHub)   │
//!                                    └──────────────┘     └─────────────┘
//! ```

pub mod chat;
pub mod config;
pub mod doc;
pub mod error;
pub mod http;
pub mod limiter;
pub mod logging;
pub mod replicate;
pub mod service;

pub use config::Config;
pub use error::{RelayError, RelayResult};
pub use service::Relay;
