pub mod connection;
pub mod engine;
pub mod error;
pub mod notify;

mod snapshot;

pub use engine::Engine;
pub use error::EngineError;
pub use notify::{LogNotifier, NotificationSink};
