//! Controller wiring for the gitmirror operator: the target lifecycle gate
//! pipeline and the rule-compilation controllers, plus the shared context
//! they run against.

pub mod context;
pub mod controllers;
pub mod error;
pub mod secrets;

pub use context::Context;
pub use error::{Error, Result};
