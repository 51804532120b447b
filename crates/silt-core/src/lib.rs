//! Silt Core - Identifier types shared by every other crate.
//!
//! Defines:
//! - `NodeId` - 256-bit node identity with the XOR metric used for routing
//! - `Cid` - content identifier embedding a BLAKE3-256 digest
//! - `hash_key` - SHA-256 hashing of textual DHT keys into the id space

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod cid;
pub mod id;

pub use cid::{Cid, CidError, CID_BYTES_LEN, CID_VERSION};
pub use id::{hash_key, Distance, NodeId, ID_BITS};
