//! Test harness for multi-node integration testing.

#![deny(unsafe_code)]

pub mod harness;

pub use harness::{TestNetwork, TestNode};
