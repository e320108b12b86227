//! lockbox-engine: chunked file encryption at rest
//!
//! ```text
//! caller ─→ Engine::encrypt(id, input, observer)
//!             ├── KeyStore::save(fresh key)
//!             ├── StorageAccountant::check_admission
//!             ├── per chunk: nonce → AES-256-GCM seal → append ciphertext
//!             ├── write tags, then nonces (awaited)
//!             └── Notifier ─→ observer (shared coordination task, weak ref)
//! ```

pub mod engine;
pub mod locks;
pub mod notify;
pub mod state;

pub use engine::{Engine, EngineBuilder, StorageUsage};
pub use notify::{
    CryptoEvent, CryptoObserver, EventSink, JobFailure, NotificationHub, Notifier,
};
pub use state::{JobState, JobTracker};
