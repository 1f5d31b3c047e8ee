//! FieldLink bridge for a serial sensor terminal.
//!
//! The sensor terminal streams framed readings over a serial port. The
//! bridge keeps the latest complete reading and forwards it on two
//! independent timers:
//!
//! - to a Meshtastic mesh radio, one text message per field
//! - to the broker, one JSON object per reading
//!
//! # Data flow
//!
//! ```text
//! serial port -> link -> assembler -> snapshot -> dispatcher -> mesh
//!                                                            -> broker
//! ```
//!
//! Every decision along the way is written to the activity [`journal`].

pub mod assembler;
pub mod broker;
pub mod config;
pub mod dispatcher;
pub mod journal;
pub mod link;
pub mod locator;
pub mod mesh;
pub mod snapshot;
pub mod supervisor;
