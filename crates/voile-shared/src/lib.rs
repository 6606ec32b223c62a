//! Shared building blocks for the Voile session core: timing and size
//! constants, the error taxonomy, core identifiers, the session crypto,
//! the data-channel frame protocol, and the magic-link codec.

pub mod constants;
pub mod crypto;
pub mod error;
pub mod link;
pub mod protocol;
pub mod types;
