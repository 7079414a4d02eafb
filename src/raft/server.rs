//! The toyraft server: a TCP shell around a Raft node. The node itself is
//! deterministic and single-threaded; this module runs the event loop that
//! drives it and the IO threads that feed it:
//!
//! - One event loop thread owning the node, multiplexing the tick timer,
//!   inbound peer messages, the node's outbound messages, client requests,
//!   and shutdown.
//! - One accept thread per listener (peers and clients), spawning a
//!   short-lived thread per connection.
//! - One sender thread per peer, which dials lazily on the first message,
//!   drops the connection on any transport error, and re-dials on the next
//!   message. Transport errors are never fatal; Raft retries on later ticks.
//!
//! The node's channel is the only boundary the event loop shares with the
//! network, so disk and network IO never block message processing, and all
//! persistence happens before the corresponding message is put on the wire.

use std::collections::HashMap;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{Receiver, Sender, TrySendError};
use log::{debug, error, info, warn};

use super::{Envelope, Log, Message, Node, NodeID, Options, Request, RequestID, Response, State};
use crate::encoding;
use crate::errdata;
use crate::error::{Error, Result};

/// The duration of a logical clock tick. With the default node options this
/// yields a 300 ms heartbeat interval and 600-1200 ms election timeouts.
pub const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// How long a peer sender waits after a failed dial before trying again.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// The write deadline for outbound peer messages. A wedged peer connection
/// fails the send and triggers a re-dial instead of stalling the sender.
const SEND_DEADLINE: Duration = Duration::from_secs(1);

/// The outbound send buffer size per peer. When a peer is unreachable the
/// buffer fills up and further messages are discarded; Raft re-sends anyway.
const SEND_BUFFER: usize = 1000;

/// A client request paired with a response channel.
type ClientCall = (Request, Sender<Result<Response>>);

/// A toyraft server.
pub struct Server {
    node: Node,
    node_rx: Receiver<Envelope>,
    peers: HashMap<NodeID, String>,
    client_tx: Sender<ClientCall>,
    client_rx: Receiver<ClientCall>,
}

impl Server {
    /// Creates a new server as part of the given cluster. peers maps the
    /// other nodes' IDs to their Raft addresses.
    pub fn new(
        id: NodeID,
        peers: HashMap<NodeID, String>,
        log: Log,
        state: Box<dyn State>,
    ) -> Result<Self> {
        let (node_tx, node_rx) = crossbeam::channel::unbounded();
        let (client_tx, client_rx) = crossbeam::channel::unbounded();
        let node = Node::new(
            id,
            peers.keys().copied().collect(),
            log,
            state,
            node_tx,
            Options::default(),
        )?;
        Ok(Self { node, node_rx, peers, client_tx, client_rx })
    }

    /// Serves Raft peer traffic and client requests until a message arrives
    /// on the shutdown channel (or it is closed). Consumes the server; on
    /// return the listeners are closed and the node has stopped.
    pub fn serve(
        self,
        raft_listener: TcpListener,
        client_listener: TcpListener,
        shutdown_rx: Receiver<()>,
    ) -> Result<()> {
        let raft_addr = raft_listener.local_addr()?;
        let client_addr = client_listener.local_addr()?;
        info!(
            "Node {} listening on {raft_addr} (raft) and {client_addr} (clients)",
            self.node.id()
        );

        let done = Arc::new(AtomicBool::new(false));
        std::thread::scope(|s| {
            let (tcp_in_tx, tcp_in_rx) = crossbeam::channel::unbounded::<Envelope>();
            let (tcp_out_tx, tcp_out_rx) = crossbeam::channel::unbounded::<Envelope>();

            // Peer senders, one per peer.
            let mut peer_txs: HashMap<NodeID, Sender<Envelope>> = HashMap::new();
            for (id, addr) in self.peers.clone() {
                let (tx, rx) = crossbeam::channel::bounded::<Envelope>(SEND_BUFFER);
                peer_txs.insert(id, tx);
                s.spawn(move || Self::send_peer(addr, rx));
            }

            // Outbound router.
            s.spawn(move || Self::route_outbound(peer_txs, tcp_out_rx));

            // Listeners.
            s.spawn({
                let tcp_in_tx = tcp_in_tx.clone();
                let done = done.clone();
                move || Self::accept_peers(raft_listener, tcp_in_tx, done)
            });
            s.spawn({
                let client_tx = self.client_tx.clone();
                let done = done.clone();
                move || Self::accept_clients(client_listener, client_tx, done)
            });

            // Drive the node until shutdown or a fatal error. Dropping the
            // outbound sender afterwards unwinds the router and peer sender
            // threads; poking the listeners unblocks the accept loops.
            let result = Self::eventloop(
                self.node,
                self.node_rx,
                self.client_rx,
                tcp_in_rx,
                tcp_out_tx,
                shutdown_rx,
            );

            done.store(true, Ordering::SeqCst);
            let _ = TcpStream::connect(raft_addr);
            let _ = TcpStream::connect(client_addr);
            result
        })
    }

    /// Runs the event loop that drives the node.
    fn eventloop(
        mut node: Node,
        node_rx: Receiver<Envelope>,
        client_rx: Receiver<ClientCall>,
        tcp_in_rx: Receiver<Envelope>,
        tcp_out_tx: Sender<Envelope>,
        shutdown_rx: Receiver<()>,
    ) -> Result<()> {
        let ticker = crossbeam::channel::tick(TICK_INTERVAL);
        let mut requests: HashMap<RequestID, Sender<Result<Response>>> = HashMap::new();
        let mut next_request_id: RequestID = 1;
        loop {
            crossbeam::select! {
                recv(ticker) -> _ => node = node.tick()?,

                recv(tcp_in_rx) -> msg => node = node.step(msg?)?,

                recv(node_rx) -> msg => {
                    let msg = msg?;
                    match msg {
                        Envelope {
                            from,
                            to,
                            message: Message::ClientResponse { id, response },
                            ..
                        } if from == to => {
                            // The client may have hung up; that's fine.
                            if let Some(response_tx) = requests.remove(&id) {
                                let _ = response_tx.send(response);
                            }
                        }
                        msg if msg.to != msg.from => tcp_out_tx.send(msg)?,
                        msg => return errdata!("unexpected local message {msg:?}"),
                    }
                }

                recv(client_rx) -> call => {
                    let (request, response_tx) = call?;
                    let id = next_request_id;
                    next_request_id += 1;
                    requests.insert(id, response_tx);
                    let msg = Envelope {
                        from: node.id(),
                        to: node.id(),
                        term: node.term(),
                        message: Message::ClientRequest { id, request },
                    };
                    node = node.step(msg)?;
                }

                recv(shutdown_rx) -> _ => {
                    info!("Node {} shutting down", node.id());
                    return Ok(());
                }
            }
        }
    }

    /// Accepts inbound peer connections, spawning a receiver thread for each.
    fn accept_peers(listener: TcpListener, tcp_in_tx: Sender<Envelope>, done: Arc<AtomicBool>) {
        for stream in listener.incoming() {
            if done.load(Ordering::SeqCst) {
                break;
            }
            match stream {
                Ok(socket) => {
                    let tcp_in_tx = tcp_in_tx.clone();
                    std::thread::spawn(move || {
                        let peer = socket.peer_addr().map(|a| a.to_string()).unwrap_or_default();
                        debug!("Raft peer {peer} connected");
                        match Self::receive_peer(socket, tcp_in_tx) {
                            Ok(()) => debug!("Raft peer {peer} disconnected"),
                            Err(err) => error!("Raft peer {peer} error: {err}"),
                        }
                    });
                }
                Err(err) => error!("Raft peer accept failed: {err}"),
            }
        }
    }

    /// Receives inbound messages from a peer connection.
    fn receive_peer(socket: TcpStream, tcp_in_tx: Sender<Envelope>) -> Result<()> {
        while let Some(envelope) = encoding::maybe_deserialize_from(&socket)? {
            tcp_in_tx.send(envelope)?;
        }
        Ok(())
    }

    /// Routes outbound messages to the right peer sender. Full send buffers
    /// drop the message: the peer is unreachable or slow, and Raft re-sends
    /// on a later tick anyway.
    fn route_outbound(peer_txs: HashMap<NodeID, Sender<Envelope>>, tcp_out_rx: Receiver<Envelope>) {
        while let Ok(msg) = tcp_out_rx.recv() {
            let Some(peer_tx) = peer_txs.get(&msg.to) else {
                error!("Outbound message for unknown peer {}", msg.to);
                continue;
            };
            match peer_tx.try_send(msg) {
                Ok(()) => {}
                Err(TrySendError::Full(msg)) => {
                    debug!("Send buffer for peer {} full, discarding message", msg.to)
                }
                Err(TrySendError::Disconnected(_)) => break,
            }
        }
    }

    /// Sends outbound messages to a single peer. The connection is dialed
    /// when there first is something to send; any error invalidates it and
    /// the next message re-dials.
    fn send_peer(addr: String, rx: Receiver<Envelope>) {
        let mut socket: Option<TcpStream> = None;
        while let Ok(msg) = rx.recv() {
            if socket.is_none() {
                match Self::dial_peer(&addr) {
                    Ok(s) => {
                        debug!("Connected to Raft peer {addr}");
                        socket = Some(s);
                    }
                    Err(err) => {
                        warn!("Failed connecting to Raft peer {addr}: {err}");
                        std::thread::sleep(RECONNECT_DELAY);
                        continue;
                    }
                }
            }
            if let Err(err) = encoding::serialize_into(socket.as_mut().expect("no socket"), &msg) {
                warn!("Failed sending to Raft peer {addr}: {err}");
                socket = None;
            }
        }
        debug!("Disconnected from Raft peer {addr}");
    }

    /// Dials a peer with bounded connect and write deadlines.
    fn dial_peer(addr: &str) -> Result<TcpStream> {
        use std::net::ToSocketAddrs as _;
        let sockaddr = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| Error::InvalidInput(format!("can't resolve peer address {addr}")))?;
        let socket = TcpStream::connect_timeout(&sockaddr, SEND_DEADLINE)?;
        socket.set_nodelay(true)?;
        socket.set_write_timeout(Some(SEND_DEADLINE))?;
        Ok(socket)
    }

    /// Accepts inbound client connections, spawning a session thread for
    /// each.
    fn accept_clients(listener: TcpListener, client_tx: Sender<ClientCall>, done: Arc<AtomicBool>) {
        for stream in listener.incoming() {
            if done.load(Ordering::SeqCst) {
                break;
            }
            match stream {
                Ok(socket) => {
                    let client_tx = client_tx.clone();
                    std::thread::spawn(move || {
                        if let Err(err) = Self::client_session(socket, client_tx) {
                            error!("Client session failed: {err}");
                        }
                    });
                }
                Err(err) => error!("Client accept failed: {err}"),
            }
        }
    }

    /// Serves a client connection: one request at a time, in order. Errors
    /// are returned to the client as part of the response; a closed response
    /// channel means the node is shutting down.
    fn client_session(socket: TcpStream, client_tx: Sender<ClientCall>) -> Result<()> {
        while let Some(request) = encoding::maybe_deserialize_from::<_, Request>(&socket)? {
            let (response_tx, response_rx) = crossbeam::channel::bounded(1);
            client_tx.send((request, response_tx))?;
            let response: Result<Response> = response_rx.recv().unwrap_or(Err(Error::Abort));
            encoding::serialize_into(&socket, &response)?;
        }
        Ok(())
    }
}
