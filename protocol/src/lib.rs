//! Plain data shared by both ends of a process's syscall channel.
//!
//! Nothing in here owns a stream or a channel. Values that do are built on
//! top of these types by the runtime crate, which moves the resources
//! alongside the serialized data.

#[macro_use]
extern crate serde;

#[cfg(test)]
mod tests;

mod messages;
mod types;

pub use messages::*;
pub use types::*;
