//! Path-addressed JSON documents with debounced persistence.
//!
//! ```text
//!  set / increment ──► DocumentStore ──► DocumentHandle (RwLock<Value>)
//!                                              │ schedule()
//!                                              ▼
//!                                     flusher task (Notify + debounce)
//!                                              │
//!                                     <data_dir>/<doc>.json ──► Replicator
//! ```

pub mod path;
pub mod persist;
pub mod store;

pub use path::{coerce_value, parse_path};
pub use persist::{DocumentHandle, FlushOutcome};
pub use store::{valid_doc_name, DocumentStore, DEFAULT_DOC};
