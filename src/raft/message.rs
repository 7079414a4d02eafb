//! Messages passed between Raft nodes, and between a node and its local
//! clients. All peer messages are term-stamped: any message from a past term
//! is dropped by the receiver, and any message from a future term demotes the
//! receiver to follower before it is processed.

use std::collections::HashMap;

use serde_derive::{Deserialize, Serialize};

use super::{Entry, Index, NodeID, Term};
use crate::error::Result;

/// A message envelope addressed between two nodes. Client requests and
/// responses are enveloped too, addressed from the local node to itself.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// The sender.
    pub from: NodeID,
    /// The recipient.
    pub to: NodeID,
    /// The sender's current term.
    pub term: Term,
    /// The message payload.
    pub message: Message,
}

/// A message payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Candidates campaign for leadership by soliciting votes from peers.
    Campaign {
        /// The index of the candidate's last log entry.
        last_index: Index,
        /// The term of the candidate's last log entry.
        last_term: Term,
    },

    /// Voters grant or deny the sender's campaign in the voter's term. A
    /// response in a term other than the campaign's is ignored.
    CampaignResponse {
        /// Whether the vote was granted.
        vote: bool,
    },

    /// Leaders replicate log entries to followers, and assert leadership. An
    /// empty entries vector is a heartbeat, following the same rules.
    Append {
        /// The index of the entry immediately before the ones sent.
        base_index: Index,
        /// The term of that base entry.
        base_term: Term,
        /// The leader's commit index.
        commit_index: Index,
        /// Entries to replicate, starting at base_index + 1.
        entries: Vec<Entry>,
    },

    /// Followers accept entries whose base matches their log, or reject them
    /// with conflict hints.
    AppendResponse {
        /// On success, the index of the last matching entry. 0 on rejection.
        match_index: Index,
        /// On rejection, hints for the leader's back-off. None on success.
        conflict: Option<Conflict>,
    },

    /// A client request, stepped on the local node only.
    ClientRequest {
        /// The request ID, unique within this node's lifetime.
        id: RequestID,
        /// The request itself.
        request: Request,
    },

    /// A client response, addressed from the local node to itself and
    /// intercepted by the server's event loop.
    ClientResponse {
        /// The ID of the original request.
        id: RequestID,
        /// The response, or an error.
        response: Result<Response>,
    },
}

/// Conflict hints on a rejected append. These let the leader skip its next
/// index back over a whole term at a time instead of probing one entry per
/// round trip, which matters after long partitions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    /// The term of the follower's entry at the rejected base index, or None
    /// if the follower's log is too short to have one.
    pub term: Option<Term>,
    /// The first index of that term in the follower's log.
    pub first_index: Index,
    /// The follower's last log index.
    pub last_index: Index,
}

/// A client request ID, assigned by the local server.
pub type RequestID = u64;

/// A client request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Request {
    /// Submits a batch of state machine commands. The leader appends them to
    /// the log and responds once all of them have been applied.
    Submit(Vec<Vec<u8>>),
    /// Reads the node's status.
    Status,
}

/// A client response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Response {
    /// State machine results for a submitted batch, in submission order.
    Submit(Vec<Result<Vec<u8>>>),
    /// The node's status.
    Status(Status),
}

/// Node status, as seen by the node that served the request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Status {
    /// The node that generated this status.
    pub server: NodeID,
    /// The current leader, if known.
    pub leader: Option<NodeID>,
    /// The current term.
    pub term: Term,
    /// The node's last log index.
    pub last_index: Index,
    /// The node's commit index.
    pub commit_index: Index,
    /// The node's applied index.
    pub apply_index: Index,
    /// Match indexes of all nodes, as tracked by the leader. Empty on
    /// followers and candidates.
    pub match_index: HashMap<NodeID, Index>,
}
