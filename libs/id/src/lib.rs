//! # orbit-id
//!
//! Typed names and IDs for the orbit fleet orchestrator.
//!
//! ## Design Principles
//!
//! - Names are chosen by operators or announced by isolates, and are stable
//!   across restarts of the identity they name
//! - Every kind of name is its own type, so an isolate can never be passed
//!   where a node is expected
//! - Names order lexicographically; the distributor relies on this for its
//!   deterministic tie-break
//! - Command IDs are system-generated and ULID-based
//!
//! ## Formats
//!
//! Names are free-form labels with strict validation:
//! - `iso-A`, `node-1`, `billing.gateway`
//!
//! Command IDs use a prefixed format: `{prefix}_{ulid}`:
//! - `cmd_01HV4Z2WQXKJNM8GPQY6VBKC3D`

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use macros::MAX_NAME_LEN;
pub use types::*;

#[doc(hidden)]
pub use ulid::Ulid;
