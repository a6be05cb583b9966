//! Core engine modules - scheduling, priority, mailbox, compositing

pub mod deferred;
pub mod engine;
pub mod mailbox;
pub mod resolver;
pub mod scheduler;
pub mod vegas;
pub mod workers;

// Re-export main types
pub use deferred::DeferredQueue;
pub use engine::Engine;
pub use mailbox::{FileStore, MailboxAdapter, MailboxStore, PublishedStatus};
pub use resolver::{PriorityResolver, PriorityState, Selection, SelectionSource};
pub use scheduler::{RotationEntry, RotationScheduler};
pub use vegas::{ScrollCursor, VegasCompositor, VegasOptions};
pub use workers::UpdatePool;
