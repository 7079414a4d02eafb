mod client;
mod log;
mod message;
mod node;
mod server;
mod state;

pub use client::Client;
pub use log::{Entry, Index, Log};
pub use message::{Conflict, Envelope, Message, Request, RequestID, Response, Status};
pub use node::{
    Node, NodeID, Options, Term, Ticks, ELECTION_TIMEOUT_RANGE, HEARTBEAT_INTERVAL,
    MAX_APPEND_ENTRIES,
};
pub use server::{Server, TICK_INTERVAL};
pub use state::State;
