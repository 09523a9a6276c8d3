//! Readiness-driven connection engine.
//!
//! Single-threaded mio event loop: poll tells us which sockets are ready,
//! then we perform non-blocking read/write syscalls. One message from one
//! client is fully handled (decode, state check, handler, queued sends)
//! before the next, which is what lets the ranking engine mutate its lists
//! without any locking.
//!
//! All per-connection failures (EOF, transport errors, protocol errors)
//! converge on `close_session`; only listener/poll failures can take the
//! process down.

use crate::catalog::Catalog;
use crate::config::Config;
use crate::dispatch::{self, DispatchOutcome};
use crate::protocol::{self, DecodeOutcome};
use crate::ranking::Leaderboard;
use crate::session::{Session, SessionRegistry};
use bytes::Buf;
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use tracing::{debug, info, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);

const READ_CHUNK: usize = 4096;

/// The trivia server: listener, poller, live sessions, and shared state.
#[derive(Debug)]
pub struct Server {
    poll: Poll,
    listener: TcpListener,
    local_addr: SocketAddr,
    sessions: SessionRegistry,
    catalog: Catalog,
    /// One leaderboard per catalog quiz, same indexing.
    boards: Vec<Leaderboard>,
}

impl Server {
    /// Bind the listening socket and register it with the poller.
    /// Bind/listen failures here are fatal to the process.
    pub fn bind(config: &Config, catalog: Catalog) -> io::Result<Server> {
        let addr: SocketAddr = config
            .listen
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        // A ranking reply covers every board; refuse configurations whose
        // worst case could not fit in a single frame
        let worst_case = dispatch::max_ranking_payload(catalog.len(), config.max_connections);
        if worst_case > protocol::MAX_PAYLOAD_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "worst-case ranking payload ({} bytes) exceeds the {}-byte frame \
                     limit; lower max_connections or serve fewer quizzes",
                    worst_case,
                    protocol::MAX_PAYLOAD_SIZE
                ),
            ));
        }

        let listener = create_listener(addr)?;
        let local_addr = listener.local_addr()?;
        let mut listener = TcpListener::from_std(listener);

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        let boards = (0..catalog.len()).map(|_| Leaderboard::new()).collect();

        Ok(Server {
            poll,
            listener,
            local_addr,
            sessions: SessionRegistry::new(config.max_connections),
            catalog,
            boards,
        })
    }

    /// The bound address; useful when listening on an ephemeral port.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Run the event loop. Returns only on a fatal listener/poll error.
    pub fn run(&mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(256);

        info!(
            addr = %self.local_addr,
            quizzes = self.catalog.len(),
            "Server listening"
        );

        loop {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e);
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => self.accept_pending()?,
                    Token(conn_id) => {
                        let readable = event.is_readable();
                        let writable = event.is_writable();
                        self.handle_session_event(conn_id, readable, writable);
                    }
                }
            }
        }
    }

    /// Accept every pending connection, greet each with the nickname
    /// prompt. Listener errors other than retry/backoff kinds are fatal.
    fn accept_pending(&mut self) -> io::Result<()> {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    let session = Session::new(stream, self.catalog.len());
                    let Some(conn_id) = self.sessions.insert(session) else {
                        // Dropping the stream closes the socket
                        warn!(peer = %peer, "Connection limit reached, rejecting connection");
                        continue;
                    };

                    let Server { poll, sessions, .. } = self;
                    let session = match sessions.get_mut(conn_id) {
                        Some(s) => s,
                        None => continue,
                    };
                    if let Err(e) = poll.registry().register(
                        &mut session.stream,
                        Token(conn_id),
                        Interest::READABLE,
                    ) {
                        debug!(conn_id, error = %e, "Failed to register connection");
                        self.close_session(conn_id);
                        continue;
                    }

                    if let Err(e) = dispatch::greet(session) {
                        debug!(conn_id, error = %e, "Failed to queue greeting");
                        self.close_session(conn_id);
                        continue;
                    }
                    if let Err(e) = self.flush_write(conn_id) {
                        debug!(conn_id, error = %e, "Connection error");
                        self.close_session(conn_id);
                        continue;
                    }

                    debug!(conn_id, peer = %peer, "Accepted connection");
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn handle_session_event(&mut self, conn_id: usize, readable: bool, writable: bool) {
        if !self.sessions.contains(conn_id) {
            return;
        }

        if readable {
            if let Err(e) = self.handle_readable(conn_id) {
                debug!(conn_id, error = %e, "Connection error");
                self.close_session(conn_id);
                return;
            }
        }

        // The readable path may have disconnected the session
        if !self.sessions.contains(conn_id) {
            return;
        }

        if writable {
            if let Err(e) = self.flush_write(conn_id) {
                debug!(conn_id, error = %e, "Connection error");
                self.close_session(conn_id);
            }
        }
    }

    /// Drain the socket, then decode and dispatch every complete frame in
    /// arrival order. EOF is reported after buffered frames are handled so
    /// a final burst of messages is not lost.
    fn handle_readable(&mut self, conn_id: usize) -> io::Result<()> {
        let mut peer_closed = false;
        {
            let session = self
                .sessions
                .get_mut(conn_id)
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "session not found"))?;

            let mut chunk = [0u8; READ_CHUNK];
            loop {
                match session.stream.read(&mut chunk) {
                    Ok(0) => {
                        peer_closed = true;
                        break;
                    }
                    Ok(n) => session.read_buf.extend_from_slice(&chunk[..n]),
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
            }
        }

        loop {
            let msg = {
                let Some(session) = self.sessions.get_mut(conn_id) else {
                    return Ok(());
                };
                match protocol::decode(&session.read_buf) {
                    Ok(DecodeOutcome::Complete(msg, consumed)) => {
                        session.read_buf.advance(consumed);
                        Some(msg)
                    }
                    Ok(DecodeOutcome::NeedData) => None,
                    Err(e) => return Err(io::Error::new(io::ErrorKind::InvalidData, e)),
                }
            };

            let Some(msg) = msg else { break };

            match dispatch::dispatch(
                conn_id,
                &msg,
                &mut self.sessions,
                &self.catalog,
                &mut self.boards,
            ) {
                Ok(DispatchOutcome::Continue) => {}
                Ok(DispatchOutcome::Disconnect) => {
                    self.close_session(conn_id);
                    return Ok(());
                }
                Err(e) => return Err(io::Error::new(io::ErrorKind::InvalidData, e)),
            }
        }

        if peer_closed {
            let mid_frame = self
                .sessions
                .get(conn_id)
                .is_some_and(|s| !s.read_buf.is_empty());
            if mid_frame {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "EOF mid-frame"));
            }
            // Clean close: the peer finished a frame and went away
            debug!(conn_id, "Peer closed connection");
            self.close_session(conn_id);
            return Ok(());
        }

        self.flush_write(conn_id)
    }

    /// Best-effort non-blocking write of the queued outbound frames.
    /// Registers for WRITABLE when the peer's window is full; the pending
    /// buffer is strictly FIFO so per-client ordering is preserved.
    fn flush_write(&mut self, conn_id: usize) -> io::Result<()> {
        let Server { poll, sessions, .. } = self;
        let session = sessions
            .get_mut(conn_id)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "session not found"))?;

        while !session.write_buf.is_empty() {
            match session.stream.write(&session.write_buf) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
                }
                Ok(n) => session.write_buf.advance(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        let interest = if session.write_buf.is_empty() {
            Interest::READABLE
        } else {
            Interest::READABLE | Interest::WRITABLE
        };
        poll.registry()
            .reregister(&mut session.stream, Token(conn_id), interest)?;

        Ok(())
    }

    /// The single disconnect transition, shared by explicit `Disconnect`
    /// messages, EOF, transport errors, and protocol errors. Idempotent:
    /// a second invocation finds no session and does nothing.
    fn close_session(&mut self, conn_id: usize) {
        if let Some(mut session) = self.sessions.remove(conn_id) {
            let _ = self.poll.registry().deregister(&mut session.stream);
            session.release_rankings(&mut self.boards);
            debug!(conn_id, nickname = ?session.nickname, "Session closed");
        }
    }
}

/// Create the non-blocking listening socket with SO_REUSEADDR.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}
