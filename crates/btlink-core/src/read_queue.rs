//! FIFO queue of pending read requests
//!
//! Pure data structure with no I/O. The request at the head is the only one
//! consuming buffered bytes; everything behind it waits its turn, so reads
//! complete strictly in enqueue order even when a later, shorter request could
//! be satisfied first.
//!
//! The queue never errors: peeking an empty queue yields `None`.

use std::collections::VecDeque;
use std::time::Duration;

use crate::types::Tag;

// ----------------------------------------------------------------------------
// Read Request
// ----------------------------------------------------------------------------

/// Queue-assigned identity of a request, used to find it again on timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(u64);

/// A pending request to accumulate `length` bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRequest {
    id: RequestId,
    length: usize,
    timeout: Option<Duration>,
    tag: Tag,
}

impl ReadRequest {
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Number of bytes this request consumes
    pub fn length(&self) -> usize {
        self.length
    }

    /// Deadline relative to enqueue time; `None` waits indefinitely
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn tag(&self) -> Tag {
        self.tag
    }
}

// ----------------------------------------------------------------------------
// Read Queue
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct ReadQueue {
    requests: VecDeque<ReadRequest>,
    next_id: u64,
}

impl ReadQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a request at the tail. A zero timeout is stored as "no timeout".
    pub fn enqueue(&mut self, length: usize, timeout: Option<Duration>, tag: Tag) -> RequestId {
        let id = RequestId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);
        self.requests.push_back(ReadRequest {
            id,
            length,
            timeout: timeout.filter(|t| !t.is_zero()),
            tag,
        });
        id
    }

    /// Length of the head request
    pub fn next_length(&self) -> Option<usize> {
        self.requests.front().map(|r| r.length)
    }

    /// Tag of the head request
    pub fn next_tag(&self) -> Option<Tag> {
        self.requests.front().map(|r| r.tag)
    }

    pub fn peek(&self) -> Option<&ReadRequest> {
        self.requests.front()
    }

    /// Look up a pending request by id
    pub fn get(&self, id: RequestId) -> Option<&ReadRequest> {
        self.requests.iter().find(|r| r.id == id)
    }

    /// Remove and return the head request
    pub fn dequeue(&mut self) -> Option<ReadRequest> {
        self.requests.pop_front()
    }

    /// Remove a specific request wherever it sits (timeout path)
    pub fn remove(&mut self, id: RequestId) -> Option<ReadRequest> {
        let index = self.requests.iter().position(|r| r.id == id)?;
        self.requests.remove(index)
    }

    /// Remove every pending request, head first
    pub fn drain(&mut self) -> Vec<ReadRequest> {
        self.requests.drain(..).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
