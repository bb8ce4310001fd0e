#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Core vocabulary shared by the `mason` scheduler and front-end: structured
//! messages, the message bus, domain errors, and the source-consistency model.

/// Structured log/status messages.
pub mod message;

/// The message bus connecting workers, scheduler and front-end.
pub mod context;

/// Structured domain errors.
pub mod error;

/// Work-item vocabulary: consistency states and workspace descriptors.
pub mod item;

pub use context::Context;
pub use error::{DomainError, ErrorDomain};
pub use item::{Consistency, Workspace};
pub use message::{Message, MessageKind};
