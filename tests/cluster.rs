//! End-to-end tests running real toyraft clusters over TCP on loopback, with
//! on-disk metadata files, exercised through the client protocol.

use std::collections::HashMap;
use std::net::TcpListener;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::Sender;
use toyraft::raft::{Log, NodeID, State, Status};
use toyraft::storage::FileStore;
use toyraft::{Client, Error, Result, Server};

/// How long to wait for cluster convergence (elections, catch-up) before
/// failing a test. Election timeouts are 600-1200 ms, so this is generous.
const WAIT: Duration = Duration::from_secs(10);

/// An accumulating register: every command appends to the register, and each
/// apply returns the accumulated contents. The result thus encodes the exact
/// apply history, which makes replay and ordering visible to assertions.
#[derive(Default)]
struct Register {
    value: Vec<u8>,
}

impl State for Register {
    fn apply(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        self.value.extend_from_slice(command);
        Ok(self.value.clone())
    }
}

struct TestNode {
    client_addr: String,
    shutdown_tx: Sender<()>,
    thread: JoinHandle<Result<()>>,
}

/// A cluster of real servers on loopback ports, each with its own metadata
/// file in a shared temporary directory.
struct TestCluster {
    nodes: HashMap<NodeID, TestNode>,
    raft_addrs: HashMap<NodeID, String>,
    dir: tempfile::TempDir,
}

impl TestCluster {
    /// Starts a new cluster of the given size. Raft listeners are bound
    /// before any node starts, so every node knows all peer addresses.
    fn new(size: u8) -> Self {
        let dir = tempfile::tempdir().expect("tempdir failed");
        let mut raft_listeners = HashMap::new();
        let mut raft_addrs = HashMap::new();
        for id in 1..=size as NodeID {
            let listener = TcpListener::bind("127.0.0.1:0").expect("bind failed");
            raft_addrs.insert(id, listener.local_addr().expect("no addr").to_string());
            raft_listeners.insert(id, listener);
        }
        let mut cluster = Self { nodes: HashMap::new(), raft_addrs, dir };
        for (id, listener) in raft_listeners {
            cluster.start(id, listener);
        }
        cluster
    }

    /// Starts a node on the given Raft listener, opening (or reopening) its
    /// metadata file.
    fn start(&mut self, id: NodeID, raft_listener: TcpListener) {
        let client_listener = TcpListener::bind("127.0.0.1:0").expect("bind failed");
        let client_addr = client_listener.local_addr().expect("no addr").to_string();
        let peers = self
            .raft_addrs
            .iter()
            .filter(|(peer, _)| **peer != id)
            .map(|(peer, addr)| (*peer, addr.clone()))
            .collect();
        let store = FileStore::new(self.dir.path(), id).expect("store failed");
        let log = Log::new(Box::new(store)).expect("log failed");
        let server =
            Server::new(id, peers, log, Box::<Register>::default()).expect("server failed");
        let (shutdown_tx, shutdown_rx) = crossbeam::channel::bounded(1);
        let thread =
            std::thread::spawn(move || server.serve(raft_listener, client_listener, shutdown_rx));
        self.nodes.insert(id, TestNode { client_addr, shutdown_tx, thread });
    }

    /// Restarts a stopped node on its original Raft address, reusing its
    /// metadata file.
    fn restart_node(&mut self, id: NodeID) {
        assert!(!self.nodes.contains_key(&id), "node {id} still running");
        let listener = TcpListener::bind(self.raft_addrs[&id].as_str()).expect("rebind failed");
        self.start(id, listener);
    }

    /// Stops a node, waiting for its server to shut down cleanly.
    fn stop_node(&mut self, id: NodeID) {
        let node = self.nodes.remove(&id).expect("unknown node");
        node.shutdown_tx.send(()).expect("shutdown send failed");
        node.thread.join().expect("server panicked").expect("server failed");
    }

    /// Connects a client to the given node.
    fn client(&self, id: NodeID) -> Client {
        Client::connect(self.nodes[&id].client_addr.as_str()).expect("connect failed")
    }

    /// Waits until some node reports itself as leader, returning its ID.
    fn wait_for_leader(&self) -> NodeID {
        let deadline = Instant::now() + WAIT;
        while Instant::now() < deadline {
            for node in self.nodes.values() {
                let Ok(mut client) = Client::connect(node.client_addr.as_str()) else { continue };
                let Ok(status) = client.status() else { continue };
                if status.leader == Some(status.server) {
                    return status.server;
                }
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        panic!("no leader elected within {WAIT:?}");
    }

    /// Waits until the given node's status satisfies the predicate.
    fn wait_for_status(&self, id: NodeID, f: impl Fn(&Status) -> bool) {
        let deadline = Instant::now() + WAIT;
        let mut last = None;
        while Instant::now() < deadline {
            if let Ok(status) = self.client(id).status() {
                if f(&status) {
                    return;
                }
                last = Some(status);
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        panic!("node {id} did not converge within {WAIT:?}, last status: {last:?}");
    }

    /// Submits a batch against whatever node is currently leader, retrying
    /// through elections and leadership changes.
    fn submit(&self, commands: Vec<Vec<u8>>) -> Vec<Result<Vec<u8>>> {
        let deadline = Instant::now() + WAIT;
        let mut last = Error::Abort;
        while Instant::now() < deadline {
            let leader = self.wait_for_leader();
            match self.client(leader).submit(commands.clone()) {
                Ok(results) => return results,
                Err(err) => last = err,
            }
            std::thread::sleep(Duration::from_millis(100));
        }
        panic!("submit did not complete within {WAIT:?}, last error: {last}");
    }
}

impl Drop for TestCluster {
    fn drop(&mut self) {
        for (_, node) in std::mem::take(&mut self.nodes) {
            let _ = node.shutdown_tx.send(());
            let _ = node.thread.join();
        }
    }
}

/// A single-node cluster elects itself and commits without any peer
/// round trips.
#[test]
fn single_node_commits() {
    let c = TestCluster::new(1);
    let leader = c.wait_for_leader();
    assert_eq!(leader, 1);

    let mut client = c.client(1);
    assert_eq!(client.submit(vec![b"x".to_vec()]).expect("submit failed"), vec![Ok(b"x".to_vec())]);

    let status = client.status().expect("status failed");
    assert_eq!(status.term, 1);
    assert_eq!(status.last_index, 1);
    assert_eq!(status.commit_index, 1);
    assert_eq!(status.apply_index, 1);
}

/// A three-node cluster elects a leader, commits a batch in order, and all
/// nodes converge on the same log and apply state.
#[test]
fn three_nodes_replicate_and_converge() {
    let c = TestCluster::new(3);

    let results = c.submit(vec![b"a".to_vec(), b"b".to_vec()]);
    assert_eq!(results, vec![Ok(b"a".to_vec()), Ok(b"ab".to_vec())]);

    for id in 1..=3 {
        c.wait_for_status(id, |s| {
            s.last_index == 2 && s.commit_index == 2 && s.apply_index == 2 && s.term >= 1
        });
    }
}

/// Submissions to a non-leader fail with NotLeader.
#[test]
fn submit_to_follower_fails() {
    let c = TestCluster::new(3);

    // Leadership may move while we pick a follower; retry until a submission
    // actually hit a non-leader.
    let deadline = Instant::now() + WAIT;
    loop {
        let leader = c.wait_for_leader();
        let follower = (1..=3).find(|id| *id != leader).expect("no follower");
        match c.client(follower).submit(vec![b"x".to_vec()]) {
            Err(Error::NotLeader { .. }) => return,
            result if Instant::now() >= deadline => {
                panic!("expected NotLeader, got {result:?}")
            }
            _ => std::thread::sleep(Duration::from_millis(50)),
        }
    }
}

/// When the leader dies, the survivors elect a new leader at a higher term
/// which continues to serve submissions with the old entries intact.
#[test]
fn leader_failover() {
    let mut c = TestCluster::new(3);
    let results = c.submit(vec![b"a".to_vec()]);
    assert_eq!(results, vec![Ok(b"a".to_vec())]);

    let old_leader = c.wait_for_leader();
    c.stop_node(old_leader);

    // The committed entry survives the failover: the new leader must have it
    // (leader completeness), so the next command applies after it.
    let results = c.submit(vec![b"b".to_vec()]);
    assert_eq!(results, vec![Ok(b"ab".to_vec())]);

    let new_leader = c.wait_for_leader();
    assert_ne!(new_leader, old_leader);
}

/// A follower that was down while the cluster committed entries catches up
/// within a few heartbeats of rejoining.
#[test]
fn rejoining_follower_catches_up() {
    let mut c = TestCluster::new(3);
    let leader = c.wait_for_leader();
    let follower = (1..=3).find(|id| *id != leader).expect("no follower");

    c.stop_node(follower);
    for i in 0..5u8 {
        let results = c.submit(vec![vec![b'a' + i]]);
        assert_eq!(results.len(), 1);
        assert!(results[0].is_ok(), "submit {i} failed: {results:?}");
    }

    c.restart_node(follower);
    c.wait_for_status(follower, |s| s.last_index == 5 && s.apply_index == 5);
}

/// A restarted node recovers its term, vote, and log from the metadata file,
/// and replays the log into the state machine before serving new commands.
#[test]
fn restart_recovers_log() {
    let mut c = TestCluster::new(1);
    c.wait_for_leader();

    let mut client = c.client(1);
    assert_eq!(client.submit(vec![b"a".to_vec()]).expect("submit failed"), vec![Ok(b"a".to_vec())]);
    assert_eq!(
        client.submit(vec![b"b".to_vec()]).expect("submit failed"),
        vec![Ok(b"ab".to_vec())]
    );
    let term_before = client.status().expect("status failed").term;

    c.stop_node(1);
    c.restart_node(1);
    c.wait_for_leader();

    // The new command is applied after the replayed log, and the term moved
    // past the pre-restart term during re-election.
    let mut client = c.client(1);
    let results = client.submit(vec![b"c".to_vec()]).expect("submit failed");
    assert_eq!(results, vec![Ok(b"abc".to_vec())]);

    let status = client.status().expect("status failed");
    assert_eq!(status.last_index, 3);
    assert_eq!(status.commit_index, 3);
    assert_eq!(status.apply_index, 3);
    assert!(status.term > term_before, "term did not advance across restart");
}
