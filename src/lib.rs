#![warn(clippy::all)]

pub mod encoding;
pub mod error;
pub mod raft;
pub mod storage;

pub use error::{Error, Result};
pub use raft::{Client, Server};
