//! Per-connection session state and the registry of live sessions.
//!
//! A session is created on accept in the `Login` state and destroyed on
//! disconnect. The registry is a slab keyed by the same id the event loop
//! uses as its poll token.

use crate::ranking::Leaderboard;
use bytes::BytesMut;
use mio::net::TcpStream;
use slab::Slab;

/// Which message types are currently legal for a session: pick a name,
/// browse the catalog, then alternate selecting and playing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connected, no nickname bound yet.
    Login,
    /// Nickname bound, catalog not yet requested.
    LoggedIn,
    /// Browsing the catalog.
    SelectingQuiz,
    /// Answering questions of `current_quiz`.
    Playing,
}

/// Server-side state for one connected client.
#[derive(Debug)]
pub struct Session {
    pub stream: TcpStream,
    pub state: SessionState,
    /// Unique among live sessions once bound; `None` during `Login`.
    pub nickname: Option<String>,
    /// Catalog index of the quiz being played; only meaningful in `Playing`.
    pub current_quiz: Option<usize>,
    /// One leaderboard handle per quiz slot, `None` until played.
    pub rankings: Vec<Option<usize>>,
    /// Inbound bytes not yet decoded into frames.
    pub read_buf: BytesMut,
    /// Encoded outbound frames not yet written to the socket.
    pub write_buf: BytesMut,
}

impl Session {
    /// Create a fresh session in `Login` with an empty ranking slot per quiz.
    pub fn new(stream: TcpStream, quiz_count: usize) -> Session {
        Session {
            stream,
            state: SessionState::Login,
            nickname: None,
            current_quiz: None,
            rankings: vec![None; quiz_count],
            read_buf: BytesMut::with_capacity(4096),
            write_buf: BytesMut::with_capacity(4096),
        }
    }

    /// Unlink every leaderboard entry this session owns. Called once from
    /// the disconnect path; `Leaderboard::remove` tolerates repeats.
    pub fn release_rankings(&mut self, boards: &mut [Leaderboard]) {
        for (quiz_idx, slot) in self.rankings.iter_mut().enumerate() {
            if let Some(handle) = slot.take() {
                boards[quiz_idx].remove(handle);
            }
        }
    }
}

/// Registry of live sessions using slab allocation.
///
/// O(1) insert, lookup, and remove; the slab key doubles as the poll token.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: Slab<Session>,
    max_sessions: usize,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> SessionRegistry {
        SessionRegistry {
            sessions: Slab::with_capacity(max_sessions),
            max_sessions,
        }
    }

    /// Insert a new session. Returns `None` at capacity.
    pub fn insert(&mut self, session: Session) -> Option<usize> {
        if self.sessions.len() >= self.max_sessions {
            return None;
        }
        Some(self.sessions.insert(session))
    }

    pub fn get(&self, id: usize) -> Option<&Session> {
        self.sessions.get(id)
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut Session> {
        self.sessions.get_mut(id)
    }

    pub fn remove(&mut self, id: usize) -> Option<Session> {
        if self.sessions.contains(id) {
            Some(self.sessions.remove(id))
        } else {
            None
        }
    }

    pub fn contains(&self, id: usize) -> bool {
        self.sessions.contains(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Linear scan for a bound nickname, case-sensitive exact match.
    pub fn nickname_taken(&self, candidate: &str) -> bool {
        self.sessions
            .iter()
            .any(|(_, s)| s.nickname.as_deref() == Some(candidate))
    }
}
