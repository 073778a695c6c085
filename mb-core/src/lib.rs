//! Wire format, topic trie, and error taxonomy shared by every broker
//! component.
//!
//! This crate is transport-agnostic: it knows how to validate topics,
//! match them against subscription patterns, and parse/serialize the
//! `action:topic:version[...]` header plus JSON payload wire format. It
//! does not open sockets — `mb-server` builds the broker on top of these
//! primitives.

pub mod codec;
pub mod error;
pub mod topic;
pub mod trie;
pub mod types;

pub use error::{Error, Result};
pub use types::{Action, ErrorCode, ErrorPayload, Header, MessageError, Version};
