//! A client for a toyraft server's client port.

use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use super::{Request, Response, Status};
use crate::encoding;
use crate::errdata;
use crate::error::{Error, Result};

/// A toyraft client. Connects to a single node and submits one request at a
/// time; commands must be submitted to the leader, so on Error::NotLeader the
/// caller should reconnect to the node given in the error.
pub struct Client {
    socket: TcpStream,
}

impl Client {
    /// Connects to a toyraft server's client address.
    pub fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let socket = TcpStream::connect(addr)?;
        socket.set_nodelay(true)?;
        Ok(Self { socket })
    }

    /// Sets a response deadline for subsequent requests, or None to wait
    /// indefinitely. An expired deadline surfaces as Error::Abort, the same
    /// way lost leadership does. The late response may still be in flight
    /// afterwards, so the client should be discarded and a new connection
    /// made.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        Ok(self.socket.set_read_timeout(timeout)?)
    }

    /// Submits a batch of commands for application to the replicated state
    /// machine, returning each command's result in input order. The call
    /// returns once all commands have been committed and applied.
    pub fn submit(&mut self, commands: Vec<Vec<u8>>) -> Result<Vec<Result<Vec<u8>>>> {
        match self.request(Request::Submit(commands))? {
            Response::Submit(results) => Ok(results),
            response => errdata!("unexpected response {response:?}"),
        }
    }

    /// Fetches the status of the connected node.
    pub fn status(&mut self) -> Result<Status> {
        match self.request(Request::Status)? {
            Response::Status(status) => Ok(status),
            response => errdata!("unexpected response {response:?}"),
        }
    }

    /// Executes a request and waits for the response.
    fn request(&mut self, request: Request) -> Result<Response> {
        encoding::serialize_into(&self.socket, &request)?;
        match encoding::maybe_deserialize_from::<_, Result<Response>>(&self.socket)? {
            Some(response) => response,
            // The server hung up, or the read deadline expired.
            None => Err(Error::Abort),
        }
    }
}
