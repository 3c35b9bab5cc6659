//! Service layer
//!
//! Message handlers the runner can attach to its subscriptions.

mod command;

pub use command::CommandHandler;
