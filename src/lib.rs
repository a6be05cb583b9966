//! MARQUEE - Pixel-matrix display engine library
//!
//! Re-exports all modules for use by binary targets.

// Core engine (resolver, scheduler, mailbox, vegas, deferred, workers)
pub mod core;

// App modules
pub mod cli;
pub mod driver;
pub mod frame;
pub mod paths;
pub mod plugins;
pub mod runner;
pub mod settings;

// Re-export commonly used types from core
pub use core::engine::Engine;
pub use core::mailbox::{MailboxAdapter, PublishedStatus};
pub use core::resolver::{PriorityResolver, PriorityState, Selection};
pub use core::scheduler::RotationScheduler;
pub use core::vegas::VegasCompositor;

// Re-export the plugin contract
pub use frame::Frame;
pub use plugins::{ModeDecl, Plugin, PluginRegistry, Segment, SegmentMode};
pub use settings::Settings;
