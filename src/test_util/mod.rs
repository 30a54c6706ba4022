//! Utilities that are useful for testing code based on the YFP server. They are used for
//!  testing the server itself, but they are also exported so that applications can test their
//!  detector and display integrations without a camera at the other end.
//!
//! Making test utilities part of the crate's regular (non-#[cfg(test)]) code is a deliberate
//!  compromise: integration tests in other crates can not see `#[cfg(test)]` items.

pub mod collaborators;
pub mod frames;
