//! Per-quiz leaderboard.
//!
//! A score-ordered doubly linked list kept inside a slab arena: entries are
//! addressed by stable `usize` handles instead of pointers, so a session can
//! hold a handle per quiz and the disconnect path can unlink without any
//! risk of dangling references. Scores only ever increase, so the single
//! reordering operation is a backward promotion walk.

use slab::Slab;

/// One client's standing in one quiz.
#[derive(Debug)]
struct Entry {
    /// Copy of the session nickname, so the board serializes on its own.
    nickname: String,
    score: u16,
    next_question: usize,
    completed: bool,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Score-ordered standings for a single quiz.
#[derive(Debug, Default)]
pub struct Leaderboard {
    entries: Slab<Entry>,
    head: Option<usize>,
    tail: Option<usize>,
    participants: u16,
}

impl Leaderboard {
    pub fn new() -> Leaderboard {
        Leaderboard::default()
    }

    /// Add a new entrant at the tail (score zero) and return its handle.
    pub fn insert(&mut self, nickname: &str) -> usize {
        let handle = self.entries.insert(Entry {
            nickname: nickname.to_string(),
            score: 0,
            next_question: 0,
            completed: false,
            prev: self.tail,
            next: None,
        });

        match self.tail {
            Some(tail) => self.entries[tail].next = Some(handle),
            None => self.head = Some(handle),
        }
        self.tail = Some(handle);
        self.participants += 1;
        handle
    }

    /// Increment the entry's score and re-seat it in the standings.
    pub fn award_point(&mut self, handle: usize) -> u16 {
        self.entries[handle].score += 1;
        self.promote(handle);
        self.entries[handle].score
    }

    /// Move an entry toward the head after a score increase.
    ///
    /// Walks backward from the old predecessor while that neighbor's score
    /// is strictly lower, then splices in after the last neighbor whose
    /// score is >= the entry's. Stable: entries with equal scores keep
    /// their relative order. No-op at the head or when the entry does not
    /// beat its immediate predecessor.
    pub fn promote(&mut self, handle: usize) {
        let score = self.entries[handle].score;
        let Some(pred) = self.entries[handle].prev else {
            return;
        };
        if self.entries[pred].score >= score {
            return;
        }

        self.unlink(handle);

        let mut cursor = Some(pred);
        while let Some(idx) = cursor {
            if self.entries[idx].score < score {
                cursor = self.entries[idx].prev;
            } else {
                break;
            }
        }

        match cursor {
            // Every predecessor scored lower: new head
            None => {
                let old_head = self.head;
                self.entries[handle].prev = None;
                self.entries[handle].next = old_head;
                if let Some(h) = old_head {
                    self.entries[h].prev = Some(handle);
                }
                self.head = Some(handle);
            }
            // Splice in directly after `idx`
            Some(idx) => {
                let after = self.entries[idx].next;
                self.entries[handle].prev = Some(idx);
                self.entries[handle].next = after;
                self.entries[idx].next = Some(handle);
                match after {
                    Some(a) => self.entries[a].prev = Some(handle),
                    None => self.tail = Some(handle),
                }
            }
        }
    }

    /// Unlink and free an entry. Safe no-op for a handle that is no longer
    /// present, which keeps the disconnect path idempotent.
    pub fn remove(&mut self, handle: usize) {
        if !self.entries.contains(handle) {
            return;
        }
        self.unlink(handle);
        self.entries.remove(handle);
        self.participants -= 1;
    }

    /// Detach an entry from the list without freeing it.
    fn unlink(&mut self, handle: usize) {
        let prev = self.entries[handle].prev;
        let next = self.entries[handle].next;

        match prev {
            Some(p) => self.entries[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.entries[n].prev = prev,
            None => self.tail = prev,
        }
        self.entries[handle].prev = None;
        self.entries[handle].next = None;
    }

    /// Index of the next unanswered question; advances by one per answer.
    pub fn next_question(&self, handle: usize) -> usize {
        self.entries[handle].next_question
    }

    /// Bump the question cursor and return the new index.
    pub fn advance_question(&mut self, handle: usize) -> usize {
        self.entries[handle].next_question += 1;
        self.entries[handle].next_question
    }

    pub fn mark_completed(&mut self, handle: usize) {
        self.entries[handle].completed = true;
    }

    pub fn is_completed(&self, handle: usize) -> bool {
        self.entries[handle].completed
    }

    pub fn score(&self, handle: usize) -> u16 {
        self.entries[handle].score
    }

    /// Number of distinct clients currently ranked in this quiz.
    pub fn participants(&self) -> u16 {
        self.participants
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Head-to-tail standings: the visible leaderboard order.
    pub fn standings(&self) -> Standings<'_> {
        Standings {
            board: self,
            cursor: self.head,
        }
    }
}

/// Iterator over `(nickname, score)` in leaderboard order.
pub struct Standings<'a> {
    board: &'a Leaderboard,
    cursor: Option<usize>,
}

impl<'a> Iterator for Standings<'a> {
    type Item = (&'a str, u16);

    fn next(&mut self) -> Option<Self::Item> {
        let handle = self.cursor?;
        let entry = &self.board.entries[handle];
        self.cursor = entry.next;
        Some((entry.nickname.as_str(), entry.score))
    }
}
