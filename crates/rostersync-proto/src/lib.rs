//! # Roster Sync Protocol
//!
//! Wire payloads and destination naming for roster synchronization.
//!
//! ## Payloads
//!
//! - Snapshot: JSON array of `{"n": id, "r": role}` delivered once on a
//!   point-to-point destination
//! - Delta: JSON array of `{"n": id, "r": role, "s": marker}` broadcast on a
//!   topic for the lifetime of the subscription
//!
//! Frames are UTF-8 text. A trailing NUL terminator is tolerated.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod destinations;
pub mod messages;
pub mod roster;

pub use destinations::{DestinationError, Destinations};
pub use messages::{DeltaEntry, DeltaKind, PayloadError, RosterEntry};
pub use roster::Roster;
