#![deny(unsafe_code)]

//! Container codec for exported broker resources
//!
//! ## Core Features:
//! - **Encrypted Container**: AES-256-GCM sealed chunks with an argon2id derived key
//! - **Record Framing**: Typed, dataId tagged, length prefixed records that may span chunks
//! - **Fragmented Writes**: One logical record written from any number of buffers
//! - **Versioned Layouts**: Readers accept older record versions and fill in later fields
//!
//! ## Architecture Components:
//! - `ContainerWriter` / `ContainerReader`: Stream level encryption and framing
//! - `types`: Record payloads (`Header`, `ClientStateRecord`, `SubscriptionRecord`, ...)
//! - `Fragments`: Zero-copy assembly of a record from several buffers
//!

#[macro_use]
mod utils;

/// Error types for encoding/decoding operations
pub mod error;

/// Record payload layouts
pub mod types;

/// Encrypted container reader and writer
pub mod container;

pub use container::{ContainerReader, ContainerWriter, KdfParams};
pub use error::{DecodeError, EncodeError};
pub use types::*;
pub use utils::{Decode, Encode, Fragments};
