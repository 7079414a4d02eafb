//! The local Raft node, driven deterministically: peer messages and client
//! requests are processed via step(), time advances via tick(). All outbound
//! messages go through the node_tx channel; the server shell moves them onto
//! the network. Disk writes are the only blocking calls made by the node, and
//! they happen before the corresponding outbound message is handed off, so a
//! vote grant or append ack is always durable before a peer can see it.

use std::collections::{HashMap, HashSet};

use crossbeam::channel::Sender;
use itertools::Itertools as _;
use log::{debug, info};
use rand::Rng as _;

use super::{Conflict, Entry, Envelope, Index, Log, Message, Request, RequestID, Response, Status};
use super::state::State;
use crate::errinput;
use crate::error::{Error, Result};
use crate::storage::MAX_COMMAND_BYTES;

/// A node ID. Must be non-zero: 0 encodes "no node" in the metadata file's
/// vote field.
pub type NodeID = u64;

/// A leader term.
pub type Term = u64;

/// A logical clock interval as number of ticks.
pub type Ticks = u8;

/// The number of ticks between leader heartbeats.
pub const HEARTBEAT_INTERVAL: Ticks = 3;

/// The range of randomized election timeouts. The lower bound is twice the
/// heartbeat interval, the upper bound four times, so a live leader always
/// beats the timeout.
pub const ELECTION_TIMEOUT_RANGE: std::ops::Range<Ticks> =
    (2 * HEARTBEAT_INTERVAL)..(4 * HEARTBEAT_INTERVAL);

/// The maximum number of entries shipped in a single append message while a
/// follower is catching up.
pub const MAX_APPEND_ENTRIES: usize = 64;

/// Raft node options.
pub struct Options {
    /// The number of ticks between leader heartbeats.
    pub heartbeat_interval: Ticks,
    /// The range of randomized election timeouts for followers and candidates.
    pub election_timeout_range: std::ops::Range<Ticks>,
    /// Maximum number of entries in a single append message.
    pub max_append_entries: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            heartbeat_interval: HEARTBEAT_INTERVAL,
            election_timeout_range: ELECTION_TIMEOUT_RANGE,
            max_append_entries: MAX_APPEND_ENTRIES,
        }
    }
}

/// A Raft node, with a dynamic role. step() and tick() consume the node and
/// return a new one with a possibly different role.
///
/// This enum wraps the RawNode<Role> types, which implement the actual node
/// logic. It exists for ergonomic use across role transitions, i.e.
/// node = node.step()?.
pub enum Node {
    Candidate(RawNode<Candidate>),
    Follower(RawNode<Follower>),
    Leader(RawNode<Leader>),
}

impl Node {
    /// Creates a new Raft node, starting as a leaderless follower, or leader
    /// if there are no peers.
    pub fn new(
        id: NodeID,
        peers: HashSet<NodeID>,
        log: Log,
        state: Box<dyn State>,
        node_tx: Sender<Envelope>,
        opts: Options,
    ) -> Result<Self> {
        assert_ne!(id, 0, "node ID must be non-zero");
        assert!(!peers.contains(&id), "node can't peer with itself");
        let node = RawNode::new(id, peers, log, state, node_tx, opts)?;
        if node.peers.is_empty() {
            // If there are no peers, win the election uncontested.
            return Ok(node.into_candidate()?.into_leader()?.into());
        }
        Ok(node.into())
    }

    /// Returns the node ID.
    pub fn id(&self) -> NodeID {
        match self {
            Node::Candidate(n) => n.id,
            Node::Follower(n) => n.id,
            Node::Leader(n) => n.id,
        }
    }

    /// Returns the node term.
    pub fn term(&self) -> Term {
        match self {
            Node::Candidate(n) => n.term(),
            Node::Follower(n) => n.term(),
            Node::Leader(n) => n.term(),
        }
    }

    /// Processes a message from a peer or local client.
    pub fn step(self, msg: Envelope) -> Result<Self> {
        debug!("Stepping {msg:?}");
        match self {
            Node::Candidate(n) => n.step(msg),
            Node::Follower(n) => n.step(msg),
            Node::Leader(n) => n.step(msg),
        }
    }

    /// Moves time forward by a tick.
    pub fn tick(self) -> Result<Self> {
        match self {
            Node::Candidate(n) => n.tick(),
            Node::Follower(n) => n.tick(),
            Node::Leader(n) => n.tick(),
        }
    }
}

impl From<RawNode<Candidate>> for Node {
    fn from(n: RawNode<Candidate>) -> Self {
        Node::Candidate(n)
    }
}

impl From<RawNode<Follower>> for Node {
    fn from(n: RawNode<Follower>) -> Self {
        Node::Follower(n)
    }
}

impl From<RawNode<Leader>> for Node {
    fn from(n: RawNode<Leader>) -> Self {
        Node::Leader(n)
    }
}

/// A Raft role: leader, follower, or candidate.
pub trait Role {}

/// A Raft node with the concrete role R.
///
/// This implements the typestate pattern, where individual node states
/// (roles) are encoded as RawNode<Role>.
pub struct RawNode<R: Role = Follower> {
    id: NodeID,
    peers: HashSet<NodeID>,
    log: Log,
    state: Box<dyn State>,
    /// The index of the last entry applied to the state machine. Volatile:
    /// a restarted node replays the log from the start.
    applied_index: Index,
    node_tx: Sender<Envelope>,
    opts: Options,
    role: R,
}

impl<R: Role> RawNode<R> {
    /// Helper for role transitions.
    fn into_role<T: Role>(self, role: T) -> RawNode<T> {
        RawNode {
            id: self.id,
            peers: self.peers,
            log: self.log,
            state: self.state,
            applied_index: self.applied_index,
            node_tx: self.node_tx,
            opts: self.opts,
            role,
        }
    }

    /// Returns the node's current term.
    fn term(&self) -> Term {
        self.log.get_term().0
    }

    /// Returns the cluster size as number of nodes.
    fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    /// Returns the cluster quorum size (strict majority).
    fn quorum_size(&self) -> usize {
        self.cluster_size() / 2 + 1
    }

    /// Returns the quorum value of the given unsorted vector, in descending
    /// order. The vector must have the same size as the cluster.
    fn quorum_value<T: Ord + Copy>(&self, mut values: Vec<T>) -> T {
        assert_eq!(values.len(), self.cluster_size(), "vector size must match cluster size");
        *values.select_nth_unstable_by(self.quorum_size() - 1, |a, b: &T| a.cmp(b).reverse()).1
    }

    /// Sends a message.
    fn send(&self, to: NodeID, message: Message) -> Result<()> {
        let msg = Envelope { from: self.id, to, term: self.term(), message };
        debug!("Sending {msg:?}");
        Ok(self.node_tx.send(msg)?)
    }

    /// Broadcasts a message to all peers, in sorted order for determinism.
    fn broadcast(&self, message: Message) -> Result<()> {
        for id in self.peers.iter().copied().sorted() {
            self.send(id, message.clone())?;
        }
        Ok(())
    }

    /// Generates a randomized election timeout.
    fn gen_election_timeout(&self) -> Ticks {
        rand::thread_rng().gen_range(self.opts.election_timeout_range.clone())
    }

    /// Applies any committed but unapplied entries, discarding the results.
    /// Only the leader has clients waiting on results; see
    /// RawNode<Leader>::maybe_commit_and_apply().
    fn maybe_apply(&mut self) -> Result<()> {
        while self.applied_index < self.log.commit_index() {
            let index = self.applied_index + 1;
            let entry = self.log.get(index).expect("missing committed entry");
            debug!("Applying {entry:?}");
            // Any error here is part of the result and must be deterministic;
            // non-deterministic failures have to panic in the state machine
            // itself, or replicas would diverge.
            let _ = self.state.apply(&entry.command);
            self.applied_index = index;
        }
        Ok(())
    }

    /// Builds a node status report.
    fn status(&self, leader: Option<NodeID>, match_index: HashMap<NodeID, Index>) -> Status {
        Status {
            server: self.id,
            leader,
            term: self.term(),
            last_index: self.log.last().0,
            commit_index: self.log.commit_index(),
            apply_index: self.applied_index,
            match_index,
        }
    }

    /// Asserts message invariants when stepping.
    fn assert_step(&self, msg: &Envelope) {
        assert_eq!(msg.to, self.id, "message to other node");
        assert!(
            msg.from == self.id || self.peers.contains(&msg.from),
            "unknown sender {}",
            msg.from
        );
    }
}

/// A candidate is campaigning to become a leader.
pub struct Candidate {
    /// Votes received, including our own.
    votes: HashSet<NodeID>,
    /// Ticks elapsed since election start.
    election_duration: Ticks,
    /// Election timeout, in ticks.
    election_timeout: Ticks,
}

impl Candidate {
    fn new(election_timeout: Ticks) -> Self {
        Self { votes: HashSet::new(), election_duration: 0, election_timeout }
    }
}

impl Role for Candidate {}

impl RawNode<Candidate> {
    /// Asserts internal invariants.
    fn assert(&mut self) -> Result<()> {
        assert_ne!(self.term(), 0, "candidates can't have term 0");
        assert!(self.role.votes.contains(&self.id), "candidate did not vote for self");
        debug_assert_eq!(Some(self.id), self.log.get_term().1, "log vote does not match self");
        assert!(
            self.role.election_duration < self.role.election_timeout,
            "election timeout passed"
        );
        Ok(())
    }

    /// Transitions the candidate to a follower. We either lost the election
    /// and follow the winner, or we discovered a new term in which case we
    /// step into it as a leaderless follower.
    fn into_follower(mut self, term: Term, leader: Option<NodeID>) -> Result<RawNode<Follower>> {
        assert!(term >= self.term(), "term regression {} → {}", self.term(), term);

        let election_timeout = self.gen_election_timeout();
        if let Some(leader) = leader {
            // We lost the election, follow the winner.
            assert_eq!(term, self.term(), "can't follow leader in different term");
            info!("Lost election, following leader {leader} in term {term}");
            Ok(self.into_role(Follower::new(Some(leader), election_timeout)))
        } else {
            // We found a new term, but don't know the leader yet. We'll find
            // out when we step a message from it.
            assert_ne!(term, self.term(), "can't become leaderless follower in current term");
            info!("Discovered new term {term}");
            self.log.set_term(term, None)?;
            Ok(self.into_role(Follower::new(None, election_timeout)))
        }
    }

    /// Transitions the candidate to a leader. We won the election. The new
    /// leader immediately broadcasts an empty append, both to assert
    /// leadership and to discover how far behind each follower is.
    fn into_leader(self) -> Result<RawNode<Leader>> {
        info!("Won election for term {}, becoming leader", self.term());
        let peers = self.peers.clone();
        let (last_index, _) = self.log.last();
        let mut node = self.into_role(Leader::new(peers, last_index));
        node.heartbeat()?;
        Ok(node)
    }

    /// Processes a message.
    fn step(mut self, msg: Envelope) -> Result<Node> {
        self.assert()?;
        self.assert_step(&msg);

        // Drop messages from past terms.
        if msg.term < self.term() {
            debug!("Dropping message from past term ({msg:?})");
            return Ok(self.into());
        }

        // If we receive a message for a future term, become a leaderless
        // follower in it and step the message. If the message is an append
        // from the new leader, stepping it will follow the leader.
        if msg.term > self.term() {
            return self.into_follower(msg.term, None)?.step(msg);
        }

        match msg.message {
            // Don't grant votes for other candidates who also campaign.
            Message::Campaign { .. } => {
                self.send(msg.from, Message::CampaignResponse { vote: false })?
            }

            // If we received a vote, record it. If the vote gives us quorum,
            // assume leadership.
            Message::CampaignResponse { vote: true } => {
                self.role.votes.insert(msg.from);
                if self.role.votes.len() >= self.quorum_size() {
                    return Ok(self.into_leader()?.into());
                }
            }

            // We didn't get the vote.
            Message::CampaignResponse { vote: false } => {}

            // If we receive an append in this term, we lost the election and
            // have a new leader. Follow it and step the message.
            Message::Append { .. } => {
                return self.into_follower(msg.term, Some(msg.from))?.step(msg);
            }

            // Serve status requests locally; refuse submissions.
            Message::ClientRequest { id, request: Request::Status } => {
                let status = self.status(None, HashMap::new());
                let response = Ok(Response::Status(status));
                self.send(msg.from, Message::ClientResponse { id, response })?;
            }
            Message::ClientRequest { id, .. } => {
                let response = Err(Error::NotLeader { leader: None });
                self.send(msg.from, Message::ClientResponse { id, response })?;
            }

            // We're not a leader in this term, so we shouldn't see these.
            Message::AppendResponse { .. } | Message::ClientResponse { .. } => {
                panic!("received unexpected message {msg:?}")
            }
        }
        Ok(self.into())
    }

    /// Processes a logical clock tick.
    fn tick(mut self) -> Result<Node> {
        self.assert()?;
        self.role.election_duration += 1;
        if self.role.election_duration >= self.role.election_timeout {
            self.campaign()?;
        }
        Ok(self.into())
    }

    /// Campaigns for leadership by increasing the term, voting for ourself,
    /// and soliciting votes from all peers. The term bump and self-vote are
    /// persisted before any peer hears about them.
    fn campaign(&mut self) -> Result<()> {
        let term = self.term() + 1;
        info!("Starting new election for term {term}");
        self.role = Candidate::new(self.gen_election_timeout());
        self.role.votes.insert(self.id); // vote for ourself
        self.log.set_term(term, Some(self.id))?;

        let (last_index, last_term) = self.log.last();
        self.broadcast(Message::Campaign { last_index, last_term })?;
        Ok(())
    }
}

// A follower replicates state from a leader.
pub struct Follower {
    /// The leader, or None if just initialized.
    leader: Option<NodeID>,
    /// The number of ticks since the last message from the leader.
    leader_seen: Ticks,
    /// The leader_seen timeout before triggering an election.
    election_timeout: Ticks,
}

impl Follower {
    fn new(leader: Option<NodeID>, election_timeout: Ticks) -> Self {
        Self { leader, leader_seen: 0, election_timeout }
    }
}

impl Role for Follower {}

impl RawNode<Follower> {
    /// Creates a new node as a leaderless follower.
    fn new(
        id: NodeID,
        peers: HashSet<NodeID>,
        log: Log,
        state: Box<dyn State>,
        node_tx: Sender<Envelope>,
        opts: Options,
    ) -> Result<Self> {
        let role = Follower::new(None, 0);
        let mut node =
            Self { id, peers, log, state, applied_index: 0, node_tx, opts, role };
        node.role.election_timeout = node.gen_election_timeout();
        Ok(node)
    }

    /// Asserts internal invariants.
    fn assert(&mut self) -> Result<()> {
        if let Some(leader) = self.role.leader {
            assert_ne!(leader, self.id, "can't follow self");
            assert!(self.peers.contains(&leader), "leader not in peers");
            assert_ne!(self.term(), 0, "followers with leaders can't have term 0");
        }
        assert!(self.role.leader_seen < self.role.election_timeout, "election timeout passed");
        assert!(self.applied_index <= self.log.commit_index(), "applied index beyond commit");
        Ok(())
    }

    /// Transitions the follower into a candidate, by campaigning for
    /// leadership in a new term.
    fn into_candidate(mut self) -> Result<RawNode<Candidate>> {
        // Apply any pending committed entries, so we're caught up if we win.
        self.maybe_apply()?;

        let election_timeout = self.gen_election_timeout();
        let mut node = self.into_role(Candidate::new(election_timeout));
        node.campaign()?;
        Ok(node)
    }

    /// Transitions the follower into a follower, either a leaderless follower
    /// in a new term or following a leader in the current term once someone
    /// wins the election.
    fn into_follower(mut self, term: Term, leader: Option<NodeID>) -> Result<RawNode<Follower>> {
        assert!(term >= self.term(), "term regression {} → {}", self.term(), term);

        if let Some(leader) = leader {
            // We found a leader in the current term.
            assert_eq!(self.role.leader, None, "already have leader in term");
            assert_eq!(term, self.term(), "can't follow leader in different term");
            info!("Following leader {leader} in term {term}");
            self.role = Follower::new(Some(leader), self.role.election_timeout);
        } else {
            // We found a new term, but don't know the leader yet.
            assert_ne!(term, self.term(), "can't become leaderless follower in current term");
            info!("Discovered new term {term}");
            self.log.set_term(term, None)?;
            self.role = Follower::new(None, self.gen_election_timeout());
        }
        Ok(self)
    }

    /// Processes a message.
    fn step(mut self, msg: Envelope) -> Result<Node> {
        self.assert()?;
        self.assert_step(&msg);

        // Drop messages from past terms.
        if msg.term < self.term() {
            debug!("Dropping message from past term ({msg:?})");
            return Ok(self.into());
        }

        // If we receive a message for a future term, become a leaderless
        // follower in it and step the message. If the message is an append
        // from the new leader, stepping it will follow the leader.
        if msg.term > self.term() {
            return self.into_follower(msg.term, None)?.step(msg);
        }

        // Record when we last saw a message from the leader (if any).
        if self.role.leader == Some(msg.from) {
            self.role.leader_seen = 0;
        }

        match msg.message {
            // The leader replicates entries, or sends empty appends as
            // heartbeats. Both assert its leadership in this term.
            Message::Append { base_index, base_term, commit_index, entries } => {
                if let Some(first) = entries.first() {
                    assert_eq!(first.index, base_index + 1, "append entries out of sequence");
                }

                // The sender is the leader in this term. Follow it if we
                // haven't already, and reset the election timer.
                match self.role.leader {
                    Some(leader) => assert_eq!(msg.from, leader, "multiple leaders in term"),
                    None => self = self.into_follower(msg.term, Some(msg.from))?,
                }
                self.role.leader_seen = 0;

                // If the base entry isn't in our log, reject the append and
                // hint where the leader should resume.
                if !self.log.has(base_index, base_term) {
                    self.send(
                        msg.from,
                        Message::AppendResponse {
                            match_index: 0,
                            conflict: Some(self.conflict(base_index)),
                        },
                    )?;
                    return Ok(self.into());
                }

                // Append the entries to our log, truncating any conflicting
                // tail, and ack once they're durable.
                let match_index = base_index + entries.len() as Index;
                self.log.splice(entries)?;
                self.send(
                    msg.from,
                    Message::AppendResponse { match_index, conflict: None },
                )?;

                // Advance the commit index, but never past the last entry
                // known to match the leader, and apply.
                let commit_index = std::cmp::min(commit_index, match_index);
                if commit_index > self.log.commit_index() {
                    self.log.commit(commit_index);
                    self.maybe_apply()?;
                }
            }

            // A candidate in this term is requesting our vote.
            Message::Campaign { last_index, last_term } => {
                // Don't vote if we already voted for someone else in this term.
                if let (_, Some(vote)) = self.log.get_term() {
                    if msg.from != vote {
                        self.send(msg.from, Message::CampaignResponse { vote: false })?;
                        return Ok(self.into());
                    }
                }

                // Don't vote if our log is more up-to-date than the candidate's.
                let (log_index, log_term) = self.log.last();
                if log_term > last_term || log_term == last_term && log_index > last_index {
                    self.send(msg.from, Message::CampaignResponse { vote: false })?;
                    return Ok(self.into());
                }

                // Grant the vote, durably, and hold off on campaigning
                // ourselves for another timeout.
                info!("Voting for {} in term {} election", msg.from, msg.term);
                self.log.set_term(msg.term, Some(msg.from))?;
                self.role.leader_seen = 0;
                self.send(msg.from, Message::CampaignResponse { vote: true })?;
            }

            // A vote may arrive after we lost the election and followed a
            // different leader. Ignore it.
            Message::CampaignResponse { .. } => {}

            // Serve status requests locally; submissions must go to the
            // leader, which we point the client at if we know it.
            Message::ClientRequest { id, request: Request::Status } => {
                let status = self.status(self.role.leader, HashMap::new());
                let response = Ok(Response::Status(status));
                self.send(msg.from, Message::ClientResponse { id, response })?;
            }
            Message::ClientRequest { id, .. } => {
                let response = Err(Error::NotLeader { leader: self.role.leader });
                self.send(msg.from, Message::ClientResponse { id, response })?;
            }

            // We're not a leader nor candidate in this term, so we shouldn't
            // see these.
            Message::AppendResponse { .. } | Message::ClientResponse { .. } => {
                panic!("received unexpected message {msg:?}")
            }
        };
        Ok(self.into())
    }

    /// Processes a logical clock tick.
    fn tick(mut self) -> Result<Node> {
        self.assert()?;
        self.role.leader_seen += 1;
        if self.role.leader_seen >= self.role.election_timeout {
            return Ok(self.into_candidate()?.into());
        }
        Ok(self.into())
    }

    /// Builds conflict hints for a rejected append at the given base index:
    /// the term of our conflicting entry (or None if our log is too short),
    /// the first index of that term, and our last index. The leader uses
    /// these to skip back a whole term per round trip.
    fn conflict(&self, base_index: Index) -> Conflict {
        let (last_index, _) = self.log.last();
        match self.log.get(base_index) {
            Some(entry) => {
                let term = entry.term;
                let mut first_index = base_index;
                while first_index > 1
                    && self.log.get(first_index - 1).map(|e| e.term) == Some(term)
                {
                    first_index -= 1;
                }
                Conflict { term: Some(term), first_index, last_index }
            }
            None => Conflict { term: None, first_index: 0, last_index },
        }
    }
}

/// Follower replication progress, reset when a node becomes leader.
struct Progress {
    /// The next index to replicate to the follower.
    next_index: Index,
    /// The last index where the follower's log matches the leader.
    match_index: Index,
}

impl Progress {
    /// Attempts to advance the follower's match index, returning true if it
    /// did. next_index always stays ahead of match_index.
    fn advance(&mut self, match_index: Index) -> bool {
        if match_index <= self.match_index {
            return false;
        }
        self.match_index = match_index;
        self.next_index = std::cmp::max(self.next_index, match_index + 1);
        true
    }

    /// Regresses the next index to the given index, if it's currently
    /// greater. Can't regress below match_index + 1. Returns true if
    /// next_index changed.
    fn regress_next(&mut self, next_index: Index) -> bool {
        if next_index >= self.next_index || self.next_index <= self.match_index + 1 {
            return false;
        }
        self.next_index = std::cmp::max(next_index, self.match_index + 1);
        true
    }
}

/// A pending submission batch. Commands occupy the contiguous log indexes
/// [first_index, first_index + results.len()); the batch resolves once every
/// slot has its apply result, and aborts if leadership is lost first.
struct Batch {
    /// The log index of the batch's first command.
    first_index: Index,
    /// Apply results, filled in as entries are applied.
    results: Vec<Option<Result<Vec<u8>>>>,
}

// A leader serves requests and replicates the log to followers.
pub struct Leader {
    /// Follower replication progress.
    progress: HashMap<NodeID, Progress>,
    /// Log indexes with a client waiting on the apply result, keyed to the
    /// submission they belong to.
    writes: HashMap<Index, RequestID>,
    /// Pending submission batches by request ID.
    batches: HashMap<RequestID, Batch>,
    /// Number of ticks since the last periodic heartbeat.
    since_heartbeat: Ticks,
}

impl Leader {
    fn new(peers: HashSet<NodeID>, last_index: Index) -> Self {
        let next_index = last_index + 1;
        let progress =
            peers.into_iter().map(|p| (p, Progress { next_index, match_index: 0 })).collect();
        Self {
            progress,
            writes: HashMap::new(),
            batches: HashMap::new(),
            since_heartbeat: 0,
        }
    }
}

impl Role for Leader {}

impl RawNode<Leader> {
    /// Asserts internal invariants.
    fn assert(&mut self) -> Result<()> {
        assert_ne!(self.term(), 0, "leaders can't have term 0");
        debug_assert_eq!(Some(self.id), self.log.get_term().1, "log vote does not match self");
        Ok(())
    }

    /// Transitions the leader into a follower. This can only happen when we
    /// discover a new term, so we become a leaderless follower.
    fn into_follower(mut self, term: Term) -> Result<RawNode<Follower>> {
        assert!(term > self.term(), "can only become follower in later term");
        info!("Discovered new term {term}");

        // Abort all in-flight submissions. The client observes this as lost
        // leadership and must retry against the new leader.
        self.role.writes.clear();
        for id in std::mem::take(&mut self.role.batches).into_keys().sorted() {
            self.send(self.id, Message::ClientResponse { id, response: Err(Error::Abort) })?;
        }

        self.log.set_term(term, None)?;
        let election_timeout = self.gen_election_timeout();
        Ok(self.into_role(Follower::new(None, election_timeout)))
    }

    /// Processes a message.
    fn step(mut self, msg: Envelope) -> Result<Node> {
        self.assert()?;
        self.assert_step(&msg);

        // Drop messages from past terms.
        if msg.term < self.term() {
            debug!("Dropping message from past term ({msg:?})");
            return Ok(self.into());
        }

        // If we receive a message for a future term, become a leaderless
        // follower in it and step the message.
        if msg.term > self.term() {
            return self.into_follower(msg.term)?.step(msg);
        }

        match msg.message {
            // There can't be two leaders in the same term.
            Message::Append { .. } => {
                panic!("saw other leader {} in term {}", msg.from, msg.term)
            }

            // Don't grant votes in a term where we're already leader.
            Message::Campaign { .. } => {
                self.send(msg.from, Message::CampaignResponse { vote: false })?
            }

            // Votes can come in after we won the election. Ignore them.
            Message::CampaignResponse { .. } => {}

            // A follower appended our entries (or confirmed an empty
            // heartbeat, with match_index 0 when nothing matched yet). Record
            // its progress, attempt to commit, and ship it the next batch if
            // it's still behind.
            Message::AppendResponse { match_index, conflict: None } => {
                assert!(match_index <= self.log.last().0, "follower matched unknown index");
                if self.progress_mut(msg.from).advance(match_index) {
                    self.maybe_commit_and_apply()?;
                }
                self.maybe_send_append(msg.from)?;
            }

            // A follower rejected entries because the base entry didn't match
            // its log. Back off past the conflicting term and retry.
            Message::AppendResponse { match_index: 0, conflict: Some(conflict) } => {
                let next_index = match conflict.term {
                    // Skip past our last entry of the conflicting term, if we
                    // have one, otherwise to where that term starts in the
                    // follower's log.
                    Some(term) => match self.last_index_of_term(term) {
                        Some(index) => index + 1,
                        None => conflict.first_index,
                    },
                    // The follower's log is shorter than the base index.
                    // Resume right after its last entry.
                    None => conflict.last_index + 1,
                };
                if self.progress_mut(msg.from).regress_next(next_index) {
                    self.maybe_send_append(msg.from)?;
                }
            }

            Message::AppendResponse { conflict: Some(_), .. } => panic!("invalid message {msg:?}"),

            // A client submitted a batch of commands. Append them and track
            // the request until every command has been applied.
            Message::ClientRequest { id, request: Request::Submit(commands) } => {
                self.submit(id, commands)?;
            }

            Message::ClientRequest { id, request: Request::Status } => {
                let match_index = self
                    .role
                    .progress
                    .iter()
                    .map(|(id, p)| (*id, p.match_index))
                    .chain(std::iter::once((self.id, self.log.last().0)))
                    .collect();
                let status = self.status(Some(self.id), match_index);
                let response = Ok(Response::Status(status));
                self.send(msg.from, Message::ClientResponse { id, response })?;
            }

            // We never submit requests to other nodes, so we shouldn't see
            // responses.
            Message::ClientResponse { .. } => panic!("received unexpected message {msg:?}"),
        }

        Ok(self.into())
    }

    /// Processes a logical clock tick.
    fn tick(mut self) -> Result<Node> {
        self.assert()?;
        self.role.since_heartbeat += 1;
        if self.role.since_heartbeat >= self.opts.heartbeat_interval {
            self.heartbeat()?;
            self.role.since_heartbeat = 0;
        }
        Ok(self.into())
    }

    /// Sends an append to every peer with its pending window. An empty window
    /// is sent anyway: it asserts leadership, propagates the commit index,
    /// and probes for a matching log prefix on diverged followers.
    fn heartbeat(&mut self) -> Result<()> {
        for peer in self.peers.iter().copied().sorted() {
            self.send_append(peer)?;
        }
        Ok(())
    }

    /// Returns a peer's progress.
    fn progress(&self, id: NodeID) -> &Progress {
        self.role.progress.get(&id).expect("unknown node")
    }

    /// Returns a mutable borrow of a peer's progress.
    fn progress_mut(&mut self, id: NodeID) -> &mut Progress {
        self.role.progress.get_mut(&id).expect("unknown node")
    }

    /// Returns the last index of the given term in our log, if any.
    fn last_index_of_term(&self, term: Term) -> Option<Index> {
        self.log.entries_from(1).iter().rev().find(|e| e.term == term).map(|e| e.index)
    }

    /// Sends pending entries to a peer if there are any, according to its
    /// next index. Does nothing for peers that are caught up; the periodic
    /// heartbeat probes those.
    fn maybe_send_append(&mut self, peer: NodeID) -> Result<()> {
        if self.progress(peer).next_index <= self.log.last().0 {
            self.send_append(peer)?;
        }
        Ok(())
    }

    /// Sends entries from the peer's next index, bounded by the append batch
    /// size, or an empty append if the peer has nothing pending. Entries are
    /// resent on every heartbeat until acked; followers skip duplicates.
    fn send_append(&mut self, peer: NodeID) -> Result<()> {
        let (last_index, _) = self.log.last();
        let progress = self.progress(peer);
        assert_ne!(progress.next_index, 0, "invalid next_index 0");
        assert!(progress.next_index > progress.match_index, "next_index below match_index");
        assert!(progress.next_index <= last_index + 1, "next_index beyond log end");

        let base_index = progress.next_index - 1;
        let base_term = self.log.get(base_index).expect("missing base entry").term;
        let entries: Vec<Entry> = self
            .log
            .entries_from(progress.next_index)
            .iter()
            .take(self.opts.max_append_entries)
            .cloned()
            .collect();

        debug!("Replicating {} entries at base {base_index} to {peer}", entries.len());
        self.send(
            peer,
            Message::Append {
                base_index,
                base_term,
                commit_index: self.log.commit_index(),
                entries,
            },
        )
    }

    /// Appends a batch of client commands to the log, registers the request
    /// to receive each command's apply result, and replicates to peers. The
    /// whole batch is refused up front if any command exceeds the entry slot
    /// size. A single-node cluster commits immediately.
    fn submit(&mut self, id: RequestID, commands: Vec<Vec<u8>>) -> Result<()> {
        if let Some(command) = commands.iter().find(|c| c.len() > MAX_COMMAND_BYTES) {
            let response: Result<Response> =
                errinput!("command size {} exceeds maximum {MAX_COMMAND_BYTES}", command.len());
            return self.send(self.id, Message::ClientResponse { id, response });
        }
        if commands.is_empty() {
            let response = Ok(Response::Submit(Vec::new()));
            return self.send(self.id, Message::ClientResponse { id, response });
        }

        debug!("Appending {} commands for request {id}", commands.len());
        let count = commands.len();
        let mut first_index = 0;
        for command in commands {
            let index = self.log.append(command)?;
            if first_index == 0 {
                first_index = index;
            }
            self.role.writes.insert(index, id);
        }
        self.role.batches.insert(id, Batch { first_index, results: vec![None; count] });

        if self.peers.is_empty() {
            self.maybe_commit_and_apply()?;
        } else {
            for peer in self.peers.iter().copied().sorted() {
                self.maybe_send_append(peer)?;
            }
        }
        Ok(())
    }

    /// Commits any new entries that have been replicated to a quorum, applies
    /// them, and responds to clients whose submissions completed.
    fn maybe_commit_and_apply(&mut self) -> Result<Index> {
        // The quorum index is the highest index replicated to a majority,
        // counting our own log.
        let quorum_index = self.quorum_value(
            self.role
                .progress
                .values()
                .map(|p| p.match_index)
                .chain(std::iter::once(self.log.last().0))
                .collect(),
        );
        if quorum_index <= self.log.commit_index() {
            return Ok(self.log.commit_index());
        }

        // Only entries from our own term can be committed by counting
        // replicas; earlier entries commit implicitly along with them (see
        // section 5.4.2 of the Raft paper).
        match self.log.get(quorum_index) {
            Some(entry) if entry.term == self.term() => {}
            Some(_) => return Ok(self.log.commit_index()),
            None => panic!("missing entry at quorum index {quorum_index}"),
        }
        self.log.commit(quorum_index);

        // Apply the newly committed entries, delivering results to clients
        // waiting on them.
        while self.applied_index < self.log.commit_index() {
            let index = self.applied_index + 1;
            let entry = self.log.get(index).expect("missing committed entry").clone();
            debug!("Applying {entry:?}");
            let result = self.state.apply(&entry.command);
            self.applied_index = index;

            let Some(id) = self.role.writes.remove(&index) else { continue };
            let batch = self.role.batches.get_mut(&id).expect("write without batch");
            batch.results[(index - batch.first_index) as usize] = Some(result);
            if batch.results.iter().all(|r| r.is_some()) {
                let batch = self.role.batches.remove(&id).expect("write without batch");
                let results =
                    batch.results.into_iter().map(|r| r.expect("missing result")).collect();
                let response = Ok(Response::Submit(results));
                self.send(self.id, Message::ClientResponse { id, response })?;
            }
        }
        Ok(self.log.commit_index())
    }
}
