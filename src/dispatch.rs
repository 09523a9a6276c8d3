//! Message dispatch: state-machine gating and per-message handlers.
//!
//! Given one decoded message and the session it arrived on, validate the
//! message type against the session state, run the handler, and queue the
//! outbound frames on the session's write buffer. No socket I/O happens
//! here; the event loop owns reads and writes.
//!
//! A message type that is illegal for the current state is silently
//! ignored: no transition, no reply. Stale client-side menus are expected
//! and tolerated.

use crate::catalog::Catalog;
use crate::protocol::{self, Message, MessageType, ProtocolError};
use crate::ranking::Leaderboard;
use crate::session::{Session, SessionRegistry, SessionState};
use bytes::{BufMut, BytesMut};
use tracing::debug;

/// Longest accepted nickname, in bytes. Bounding the name length is what
/// makes the worst-case ranking payload computable at startup.
pub const MAX_NICKNAME_LEN: usize = 32;

const NICKNAME_PROMPT: &str = "Choose a nickname (it must be unique): ";
const NICKNAME_EMPTY: &str = "The nickname cannot be empty";
const NICKNAME_TOO_LONG: &str = "The nickname is too long (32 bytes maximum)";
const NICKNAME_TAKEN: &str = "Nickname already in use";
const INVALID_QUIZ: &str = "Invalid quiz selection";
const ALREADY_PLAYED: &str = "That quiz was already played in this session";
const ANSWER_CORRECT: &str = "Correct answer";
const ANSWER_WRONG: &str = "Wrong answer";
const QUIZ_COMPLETED: &str = "You completed the quiz";

/// What the event loop should do with the connection after dispatch.
#[derive(Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    Continue,
    /// Client asked to leave; run the disconnect transition.
    Disconnect,
}

/// Queue the nickname prompt sent right after accept.
pub fn greet(session: &mut Session) -> Result<(), ProtocolError> {
    queue(session, MessageType::RequestNickname, NICKNAME_PROMPT.as_bytes())
}

/// Route one decoded message for the session `conn_id`.
///
/// A `ProtocolError` here means the payload shape was wrong for its type
/// (or a reply could not be encoded); both are fatal to the connection.
pub fn dispatch(
    conn_id: usize,
    msg: &Message,
    sessions: &mut SessionRegistry,
    catalog: &Catalog,
    boards: &mut [Leaderboard],
) -> Result<DispatchOutcome, ProtocolError> {
    match msg.msg_type {
        MessageType::SetNickname => handle_set_nickname(conn_id, msg, sessions)?,
        MessageType::RequestQuizList => handle_quiz_list_request(conn_id, sessions, catalog)?,
        MessageType::SelectQuiz => handle_quiz_selection(conn_id, msg, sessions, catalog, boards)?,
        MessageType::Answer => handle_answer(conn_id, msg, sessions, catalog, boards)?,
        MessageType::RequestRanking => handle_ranking_request(conn_id, sessions, catalog, boards)?,
        MessageType::Disconnect => return Ok(DispatchOutcome::Disconnect),
        // Server-to-client types arriving inbound are ignored like any
        // other message that is illegal in the current state
        _ => {
            debug!(conn_id, msg_type = ?msg.msg_type, "Ignoring unexpected message type");
        }
    }
    Ok(DispatchOutcome::Continue)
}

/// Legal only in `Login`. Rejections keep the session in `Login` and
/// re-prompt; success binds the nickname and acknowledges it.
fn handle_set_nickname(
    conn_id: usize,
    msg: &Message,
    sessions: &mut SessionRegistry,
) -> Result<(), ProtocolError> {
    let nickname = msg.text()?.to_string();

    // The uniqueness scan borrows the whole registry, so run it before
    // taking the mutable session borrow
    let taken = sessions.nickname_taken(&nickname);

    let Some(session) = sessions.get_mut(conn_id) else {
        return Ok(());
    };
    if session.state != SessionState::Login {
        return Ok(());
    }

    if nickname.is_empty() {
        queue(session, MessageType::Info, NICKNAME_EMPTY.as_bytes())?;
        return queue(session, MessageType::RequestNickname, NICKNAME_PROMPT.as_bytes());
    }
    if nickname.len() > MAX_NICKNAME_LEN {
        queue(session, MessageType::Info, NICKNAME_TOO_LONG.as_bytes())?;
        return queue(session, MessageType::RequestNickname, NICKNAME_PROMPT.as_bytes());
    }
    if taken {
        queue(session, MessageType::Info, NICKNAME_TAKEN.as_bytes())?;
        return queue(session, MessageType::RequestNickname, NICKNAME_PROMPT.as_bytes());
    }

    debug!(conn_id, nickname = %nickname, "Nickname bound");
    session.nickname = Some(nickname);
    session.state = SessionState::LoggedIn;
    queue(session, MessageType::NicknameAccepted, &[])
}

/// Legal only in `LoggedIn`; sends the catalog and moves to `SelectingQuiz`.
fn handle_quiz_list_request(
    conn_id: usize,
    sessions: &mut SessionRegistry,
    catalog: &Catalog,
) -> Result<(), ProtocolError> {
    let Some(session) = sessions.get_mut(conn_id) else {
        return Ok(());
    };
    if session.state != SessionState::LoggedIn {
        return Ok(());
    }
    session.state = SessionState::SelectingQuiz;
    send_quiz_list(session, catalog)
}

/// Legal only in `SelectingQuiz`. Bad index or a replay attempt gets an
/// informational rejection plus a re-sent catalog; a valid selection
/// creates the leaderboard entry and sends the first question.
fn handle_quiz_selection(
    conn_id: usize,
    msg: &Message,
    sessions: &mut SessionRegistry,
    catalog: &Catalog,
    boards: &mut [Leaderboard],
) -> Result<(), ProtocolError> {
    let index = msg.quiz_index()?;

    let Some(session) = sessions.get_mut(conn_id) else {
        return Ok(());
    };
    if session.state != SessionState::SelectingQuiz {
        return Ok(());
    }

    // 1-based on the wire
    if index == 0 || index as usize > catalog.len() {
        queue(session, MessageType::Info, INVALID_QUIZ.as_bytes())?;
        return send_quiz_list(session, catalog);
    }
    let quiz_idx = (index - 1) as usize;

    if let Some(handle) = session.rankings[quiz_idx] {
        debug!(
            conn_id,
            completed = boards[quiz_idx].is_completed(handle),
            "Quiz replay rejected"
        );
        queue(session, MessageType::Info, ALREADY_PLAYED.as_bytes())?;
        return send_quiz_list(session, catalog);
    }

    let Some(nickname) = session.nickname.clone() else {
        return Ok(());
    };
    let handle = boards[quiz_idx].insert(&nickname);
    session.rankings[quiz_idx] = Some(handle);
    session.current_quiz = Some(quiz_idx);
    session.state = SessionState::Playing;

    let quiz = &catalog.quizzes()[quiz_idx];
    debug!(conn_id, quiz = %quiz.name, "Quiz selected");
    queue(session, MessageType::QuizSelected, quiz.name.as_bytes())?;
    queue(session, MessageType::Question, quiz.questions[0].prompt.as_bytes())
}

/// Legal only in `Playing`. Every answer is acknowledged and advances the
/// question cursor; a correct one also bumps the score and promotes the
/// leaderboard entry. Exhausting the quiz returns to `SelectingQuiz`.
fn handle_answer(
    conn_id: usize,
    msg: &Message,
    sessions: &mut SessionRegistry,
    catalog: &Catalog,
    boards: &mut [Leaderboard],
) -> Result<(), ProtocolError> {
    let answer = msg.text()?;

    let Some(session) = sessions.get_mut(conn_id) else {
        return Ok(());
    };
    if session.state != SessionState::Playing {
        return Ok(());
    }
    let (Some(quiz_idx), Some(handle)) = (
        session.current_quiz,
        session.current_quiz.and_then(|q| session.rankings[q]),
    ) else {
        return Ok(());
    };

    let quiz = &catalog.quizzes()[quiz_idx];
    let board = &mut boards[quiz_idx];
    let question = &quiz.questions[board.next_question(handle)];

    if question.accepts(answer) {
        board.award_point(handle);
        queue(session, MessageType::Info, ANSWER_CORRECT.as_bytes())?;
    } else {
        queue(session, MessageType::Info, ANSWER_WRONG.as_bytes())?;
    }

    let next = board.advance_question(handle);
    if next == quiz.questions.len() {
        board.mark_completed(handle);
        debug!(conn_id, quiz = %quiz.name, score = board.score(handle), "Quiz completed");
        queue(session, MessageType::Info, QUIZ_COMPLETED.as_bytes())?;
        session.current_quiz = None;
        session.state = SessionState::SelectingQuiz;
        send_quiz_list(session, catalog)
    } else {
        queue(session, MessageType::Question, quiz.questions[next].prompt.as_bytes())
    }
}

/// Legal in `SelectingQuiz` and `Playing`. Sends the leaderboard for every
/// quiz, then re-sends the contextual prompt so the client can carry on.
fn handle_ranking_request(
    conn_id: usize,
    sessions: &mut SessionRegistry,
    catalog: &Catalog,
    boards: &mut [Leaderboard],
) -> Result<(), ProtocolError> {
    let payload = encode_ranking(boards);

    let Some(session) = sessions.get_mut(conn_id) else {
        return Ok(());
    };
    match session.state {
        SessionState::SelectingQuiz => {
            queue(session, MessageType::Ranking, &payload)?;
            send_quiz_list(session, catalog)
        }
        SessionState::Playing => {
            queue(session, MessageType::Ranking, &payload)?;
            let (Some(quiz_idx), Some(handle)) = (
                session.current_quiz,
                session.current_quiz.and_then(|q| session.rankings[q]),
            ) else {
                return Ok(());
            };
            let quiz = &catalog.quizzes()[quiz_idx];
            let question = &quiz.questions[boards[quiz_idx].next_question(handle)];
            queue(session, MessageType::Question, question.prompt.as_bytes())
        }
        _ => Ok(()),
    }
}

fn send_quiz_list(session: &mut Session, catalog: &Catalog) -> Result<(), ProtocolError> {
    let payload = protocol::encode_quiz_list(catalog.names());
    queue(session, MessageType::QuizList, &payload)
}

/// Worst-case `Ranking` payload size: every session ranked in every quiz
/// under a maximum-length nickname. `Server::bind` checks this against the
/// frame limit, so a legal ranking request can never overflow a frame.
pub fn max_ranking_payload(quiz_count: usize, max_sessions: usize) -> usize {
    2 + quiz_count * (2 + max_sessions * (4 + MAX_NICKNAME_LEN))
}

/// Serialize every leaderboard:
/// `(quiz count) {(participants) [(name-len)(name)(score)] ...} ...`,
/// u16 big-endian throughout, head-to-tail order.
fn encode_ranking(boards: &[Leaderboard]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u16(boards.len() as u16);
    for board in boards {
        buf.put_u16(board.participants());
        for (nickname, score) in board.standings() {
            buf.put_u16(nickname.len() as u16);
            buf.put_slice(nickname.as_bytes());
            buf.put_u16(score);
        }
    }
    buf.to_vec()
}

/// Encode one outbound frame onto the session's write buffer.
fn queue(session: &mut Session, msg_type: MessageType, payload: &[u8]) -> Result<(), ProtocolError> {
    protocol::encode(msg_type, payload, &mut session.write_buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Question, Quiz};
    use crate::protocol::{DecodeOutcome, PayloadReader};
    use crate::session::tests::test_stream;

    fn test_catalog() -> Catalog {
        Catalog::from_quizzes(vec![
            Quiz {
                name: "Geography".to_string(),
                questions: vec![
                    Question::new("Capital of France?", &["Paris"]),
                    Question::new("Ocean west of Portugal?", &["Atlantic"]),
                ],
            },
            Quiz {
                name: "History".to_string(),
                questions: vec![Question::new("Year of the moon landing?", &["1969"])],
            },
        ])
    }

    struct Fixture {
        sessions: SessionRegistry,
        catalog: Catalog,
        boards: Vec<Leaderboard>,
    }

    impl Fixture {
        fn new() -> Fixture {
            let catalog = test_catalog();
            let boards = (0..catalog.len()).map(|_| Leaderboard::new()).collect();
            Fixture {
                sessions: SessionRegistry::new(16),
                catalog,
                boards,
            }
        }

        fn connect(&mut self) -> usize {
            self.sessions
                .insert(Session::new(test_stream(), self.catalog.len()))
                .unwrap()
        }

        fn send(&mut self, conn_id: usize, msg_type: MessageType, payload: &[u8]) -> DispatchOutcome {
            let msg = Message {
                msg_type,
                payload: payload.to_vec(),
            };
            dispatch(conn_id, &msg, &mut self.sessions, &self.catalog, &mut self.boards)
                .unwrap()
        }

        /// Drain and decode every frame queued on the session's write buffer.
        fn replies(&mut self, conn_id: usize) -> Vec<Message> {
            let session = self.sessions.get_mut(conn_id).unwrap();
            let mut out = Vec::new();
            let mut offset = 0;
            while let DecodeOutcome::Complete(msg, consumed) =
                protocol::decode(&session.write_buf[offset..]).unwrap()
            {
                out.push(msg);
                offset += consumed;
            }
            session.write_buf.clear();
            out
        }

        fn login(&mut self, conn_id: usize, nickname: &str) {
            self.send(conn_id, MessageType::SetNickname, nickname.as_bytes());
            let replies = self.replies(conn_id);
            assert_eq!(replies.last().unwrap().msg_type, MessageType::NicknameAccepted);
        }

        fn start_quiz(&mut self, conn_id: usize, index: u16) {
            self.send(conn_id, MessageType::RequestQuizList, &[]);
            self.replies(conn_id);
            self.send(conn_id, MessageType::SelectQuiz, &protocol::encode_quiz_index(index));
            let replies = self.replies(conn_id);
            assert_eq!(replies[0].msg_type, MessageType::QuizSelected);
            assert_eq!(replies[1].msg_type, MessageType::Question);
        }

        fn state(&self, conn_id: usize) -> SessionState {
            self.sessions.get(conn_id).unwrap().state
        }
    }

    #[test]
    fn test_nickname_accept_and_reject() {
        let mut fx = Fixture::new();
        let alice = fx.connect();
        let bob = fx.connect();

        fx.send(alice, MessageType::SetNickname, b"alice");
        assert_eq!(fx.replies(alice).last().unwrap().msg_type, MessageType::NicknameAccepted);
        assert_eq!(fx.state(alice), SessionState::LoggedIn);

        // Same nickname: rejection notice plus a fresh prompt, still Login
        fx.send(bob, MessageType::SetNickname, b"alice");
        let replies = fx.replies(bob);
        assert_eq!(replies[0].msg_type, MessageType::Info);
        assert_eq!(replies[0].text().unwrap(), NICKNAME_TAKEN);
        assert_eq!(replies[1].msg_type, MessageType::RequestNickname);
        assert_eq!(fx.state(bob), SessionState::Login);

        // Empty nickname also rejected
        fx.send(bob, MessageType::SetNickname, b"");
        let replies = fx.replies(bob);
        assert_eq!(replies[0].text().unwrap(), NICKNAME_EMPTY);
        assert_eq!(fx.state(bob), SessionState::Login);

        // A different name goes through
        fx.send(bob, MessageType::SetNickname, b"bob");
        assert_eq!(fx.replies(bob).last().unwrap().msg_type, MessageType::NicknameAccepted);
    }

    #[test]
    fn test_overlong_nickname_rejected() {
        let mut fx = Fixture::new();
        let conn = fx.connect();

        let long = "x".repeat(MAX_NICKNAME_LEN + 1);
        fx.send(conn, MessageType::SetNickname, long.as_bytes());
        let replies = fx.replies(conn);
        assert_eq!(replies[0].msg_type, MessageType::Info);
        assert_eq!(replies[0].text().unwrap(), NICKNAME_TOO_LONG);
        assert_eq!(replies[1].msg_type, MessageType::RequestNickname);
        assert_eq!(fx.state(conn), SessionState::Login);

        // Exactly at the limit goes through
        let max = "x".repeat(MAX_NICKNAME_LEN);
        fx.send(conn, MessageType::SetNickname, max.as_bytes());
        assert_eq!(
            fx.replies(conn).last().unwrap().msg_type,
            MessageType::NicknameAccepted
        );
    }

    /// Boards packed to the default session cap with maximum-length names
    /// must still produce a ranking that encodes into a single frame.
    #[test]
    fn test_ranking_request_fits_one_frame_at_capacity() {
        let mut fx = Fixture::new();
        let conn = fx.connect();
        fx.login(conn, "alice");
        fx.send(conn, MessageType::RequestQuizList, &[]);
        fx.replies(conn);

        let cap = 256;
        for board in &mut fx.boards {
            for i in 0..cap {
                let name = format!("{:0>width$}", i, width = MAX_NICKNAME_LEN);
                board.insert(&name);
            }
        }

        fx.send(conn, MessageType::RequestRanking, &[]);
        let replies = fx.replies(conn);
        assert_eq!(replies[0].msg_type, MessageType::Ranking);

        let bound = max_ranking_payload(fx.catalog.len(), cap);
        assert!(replies[0].payload.len() <= bound);
        assert!(bound <= protocol::MAX_PAYLOAD_SIZE);
    }

    #[test]
    fn test_illegal_messages_are_silently_ignored() {
        let mut fx = Fixture::new();
        let conn = fx.connect();

        // None of these are legal in Login
        fx.send(conn, MessageType::Answer, b"Paris");
        fx.send(conn, MessageType::RequestQuizList, &[]);
        fx.send(conn, MessageType::RequestRanking, &[]);
        fx.send(conn, MessageType::SelectQuiz, &protocol::encode_quiz_index(1));

        assert_eq!(fx.state(conn), SessionState::Login);
        assert!(fx.replies(conn).is_empty());
        assert!(fx.boards.iter().all(|b| b.is_empty()));
    }

    #[test]
    fn test_quiz_list_transitions_to_selecting() {
        let mut fx = Fixture::new();
        let conn = fx.connect();
        fx.login(conn, "alice");

        fx.send(conn, MessageType::RequestQuizList, &[]);
        let replies = fx.replies(conn);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].msg_type, MessageType::QuizList);
        assert_eq!(fx.state(conn), SessionState::SelectingQuiz);

        let mut reader = PayloadReader::new(&replies[0].payload);
        assert_eq!(reader.get_u16().unwrap(), 2);
        assert_eq!(reader.get_string().unwrap(), "Geography");
        assert_eq!(reader.get_string().unwrap(), "History");
    }

    #[test]
    fn test_out_of_range_selection_rejected_without_node() {
        let mut fx = Fixture::new();
        let conn = fx.connect();
        fx.login(conn, "alice");
        fx.send(conn, MessageType::RequestQuizList, &[]);
        fx.replies(conn);

        for bad in [0u16, 3, 99] {
            fx.send(conn, MessageType::SelectQuiz, &protocol::encode_quiz_index(bad));
            let replies = fx.replies(conn);
            assert_eq!(replies[0].msg_type, MessageType::Info);
            assert_eq!(replies[0].text().unwrap(), INVALID_QUIZ);
            assert_eq!(replies[1].msg_type, MessageType::QuizList);
            assert_eq!(fx.state(conn), SessionState::SelectingQuiz);
        }
        assert!(fx.boards.iter().all(|b| b.is_empty()));
    }

    #[test]
    fn test_answer_flow_scores_and_completes() {
        let mut fx = Fixture::new();
        let conn = fx.connect();
        fx.login(conn, "alice");
        fx.start_quiz(conn, 1);

        // Wrong answer: acknowledged, no score, next question still sent
        fx.send(conn, MessageType::Answer, b"London");
        let replies = fx.replies(conn);
        assert_eq!(replies[0].text().unwrap(), ANSWER_WRONG);
        assert_eq!(replies[1].msg_type, MessageType::Question);
        assert_eq!(replies[1].text().unwrap(), "Ocean west of Portugal?");

        // Correct, case-insensitive; this exhausts the quiz
        fx.send(conn, MessageType::Answer, b"ATLANTIC");
        let replies = fx.replies(conn);
        assert_eq!(replies[0].text().unwrap(), ANSWER_CORRECT);
        assert_eq!(replies[1].text().unwrap(), QUIZ_COMPLETED);
        assert_eq!(replies[2].msg_type, MessageType::QuizList);
        assert_eq!(fx.state(conn), SessionState::SelectingQuiz);

        let standings: Vec<(String, u16)> = fx.boards[0]
            .standings()
            .map(|(n, s)| (n.to_string(), s))
            .collect();
        assert_eq!(standings, [("alice".to_string(), 1)]);
    }

    #[test]
    fn test_replay_of_completed_quiz_rejected() {
        let mut fx = Fixture::new();
        let conn = fx.connect();
        fx.login(conn, "alice");
        fx.start_quiz(conn, 2);

        fx.send(conn, MessageType::Answer, b"1969");
        fx.replies(conn);
        assert_eq!(fx.state(conn), SessionState::SelectingQuiz);

        fx.send(conn, MessageType::SelectQuiz, &protocol::encode_quiz_index(2));
        let replies = fx.replies(conn);
        assert_eq!(replies[0].text().unwrap(), ALREADY_PLAYED);
        assert_eq!(replies[1].msg_type, MessageType::QuizList);

        // The completed entry is still ranked, not duplicated
        assert_eq!(fx.boards[1].participants(), 1);
    }

    #[test]
    fn test_ranking_payload_and_contextual_prompt() {
        let mut fx = Fixture::new();
        let alice = fx.connect();
        let bob = fx.connect();
        fx.login(alice, "alice");
        fx.login(bob, "bob");
        fx.start_quiz(alice, 1);
        fx.start_quiz(bob, 1);

        fx.send(alice, MessageType::Answer, b"Paris");
        fx.replies(alice);

        // Bob asks mid-quiz: ranking first, then his current question again
        fx.send(bob, MessageType::RequestRanking, &[]);
        let replies = fx.replies(bob);
        assert_eq!(replies[0].msg_type, MessageType::Ranking);
        assert_eq!(replies[1].msg_type, MessageType::Question);
        assert_eq!(replies[1].text().unwrap(), "Capital of France?");

        let mut reader = PayloadReader::new(&replies[0].payload);
        assert_eq!(reader.get_u16().unwrap(), 2); // quiz count
        assert_eq!(reader.get_u16().unwrap(), 2); // Geography participants
        assert_eq!(reader.get_string().unwrap(), "alice");
        assert_eq!(reader.get_u16().unwrap(), 1);
        assert_eq!(reader.get_string().unwrap(), "bob");
        assert_eq!(reader.get_u16().unwrap(), 0);
        assert_eq!(reader.get_u16().unwrap(), 0); // History participants
        assert!(reader.is_empty());
    }

    #[test]
    fn test_explicit_disconnect_outcome() {
        let mut fx = Fixture::new();
        let conn = fx.connect();
        assert_eq!(
            fx.send(conn, MessageType::Disconnect, &[]),
            DispatchOutcome::Disconnect
        );
    }

    #[test]
    fn test_malformed_select_payload_is_protocol_error() {
        let mut fx = Fixture::new();
        let conn = fx.connect();
        fx.login(conn, "alice");
        fx.send(conn, MessageType::RequestQuizList, &[]);
        fx.replies(conn);

        let msg = Message {
            msg_type: MessageType::SelectQuiz,
            payload: vec![1, 2, 3],
        };
        let err = dispatch(conn, &msg, &mut fx.sessions, &fx.catalog, &mut fx.boards)
            .unwrap_err();
        assert_eq!(err, ProtocolError::MalformedPayload);
    }
}
