//! Code-variant generation for rondel.
//!
//! Consumes the block model built by `rondel-core` and keeps two alternating
//! code-cache buffers filled with randomized, relocated copies of the
//! protected code: trampolines at every position-fixed entry, a reserved zone
//! for indirect-jump targets, and the block bodies packed in a seeded random
//! permutation. A background worker regenerates whichever buffer is not
//! ready; the coordinator swaps buffers on kernel notifications and patches
//! the live return addresses mirrored on the shadow stack.

pub mod cache;
pub mod channel;
pub mod coordinator;
pub mod encode;
pub mod layout;
pub mod manager;
pub mod maps;
pub mod rbbl;
pub mod relocate;
pub mod result;

pub use result::{Error, Result};
