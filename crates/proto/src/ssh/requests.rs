//! Ordered request/reply bookkeeping.
//!
//! SSH requests carry no identifiers: a reply always answers the oldest
//! outstanding request in the same scope (the connection for global
//! requests, one channel for channel requests). [`SentRequests`] matches
//! incoming replies to what we asked; [`ReceivedRequests`] holds back our
//! replies until every earlier request has been answered.

use std::collections::VecDeque;

use strand_platform::{StrandError, StrandResult};

/// Identifies one request for the collaborator that issued or answers it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestToken(u64);

impl RequestToken {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw value, unique within one connection.
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for RequestToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Final answer to a received request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Success, with response data (only global requests carry any)
    Success(Vec<u8>),
    /// Failure
    Failure,
}

impl Resolution {
    /// Whether this is a success.
    pub fn is_success(&self) -> bool {
        matches!(self, Resolution::Success(_))
    }
}

/// Requests we sent and still await a reply for, oldest first.
#[derive(Debug)]
pub struct SentRequests<T> {
    queue: VecDeque<(RequestToken, T)>,
}

impl<T> Default for SentRequests<T> {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
        }
    }
}

impl<T> SentRequests<T> {
    /// Records a request that wants a reply.
    pub fn push(&mut self, token: RequestToken, context: T) {
        self.queue.push_back((token, context));
    }

    /// Matches a reply to the oldest outstanding request.
    ///
    /// # Errors
    ///
    /// A reply with nothing outstanding is a protocol violation.
    pub fn pop_reply(&mut self, scope: &str) -> StrandResult<(RequestToken, T)> {
        self.queue
            .pop_front()
            .ok_or_else(|| StrandError::malformed(format!("Unexpected reply: no {} request outstanding", scope)))
    }

    /// Removes every outstanding request, oldest first.
    pub fn abort(&mut self) -> Vec<(RequestToken, T)> {
        self.queue.drain(..).collect()
    }

    /// Number of outstanding requests.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether nothing is outstanding.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Received requests that want a reply, in receive order.
#[derive(Debug)]
pub struct ReceivedRequests<T> {
    queue: VecDeque<(RequestToken, T, Option<Resolution>)>,
}

impl<T> Default for ReceivedRequests<T> {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
        }
    }
}

impl<T> ReceivedRequests<T> {
    /// Records a request whose reply is owed.
    pub fn push(&mut self, token: RequestToken, context: T) {
        self.queue.push_back((token, context, None));
    }

    /// Stores the answer for `token`. Returns `false` if it is not pending
    /// or was already answered.
    pub fn resolve(&mut self, token: RequestToken, resolution: Resolution) -> bool {
        match self
            .queue
            .iter_mut()
            .find(|(t, _, r)| *t == token && r.is_none())
        {
            Some(entry) => {
                entry.2 = Some(resolution);
                true
            }
            None => false,
        }
    }

    /// Pops the head once it has been answered.
    pub fn pop_ready(&mut self) -> Option<(RequestToken, T, Resolution)> {
        if !matches!(self.queue.front(), Some((_, _, Some(_)))) {
            return None;
        }
        let (token, context, resolution) = self.queue.pop_front()?;
        resolution.map(|r| (token, context, r))
    }

    /// Whether `token` still awaits an answer.
    pub fn contains(&self, token: RequestToken) -> bool {
        self.queue.iter().any(|(t, _, r)| *t == token && r.is_none())
    }

    /// Number of replies still owed.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether no reply is owed.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Forgets every pending request.
    pub fn clear(&mut self) {
        self.queue.clear();
    }
}
