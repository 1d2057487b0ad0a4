//! Per-stream bookkeeping for the connection task.

use std::collections::VecDeque;
use std::fmt;

use bytes::Bytes;

use drover_codec::stream::StreamId;

/// Receive-side parsing state of a stream.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Status {
    /// Peer unidirectional stream awaiting its type tag.
    Header,
    /// Between frames.
    Normal,
    /// Inside a DATA frame body with this many bytes left.
    Data(u64),
    /// Receive side aborted; incoming bytes are dropped.
    Discard,
}

/// A live stream. `buffer` holds at most one incomplete frame; it is
/// always empty while inside a DATA body, whose bytes are streamed to the
/// handler rather than accumulated.
pub(crate) struct Stream<S> {
    pub(crate) status: Status,
    pub(crate) buffer: Bytes,
    /// The stream handler's state, present once a request was dispatched.
    pub(crate) state: Option<S>,
}

impl<S> Stream<S> {
    pub(crate) fn new(status: Status) -> Self {
        Self {
            status,
            buffer: Bytes::new(),
            state: None,
        }
    }
}

impl<S> fmt::Debug for Stream<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("status", &self.status)
            .field("buffer", &self.buffer.len())
            .field("state", &self.state.is_some())
            .finish()
    }
}

/// Recently reset stream ids, most recent first. Data or messages racing
/// with a reset land here instead of producing spurious warnings.
#[derive(Debug, Default)]
pub(crate) struct Lingering {
    refs: VecDeque<StreamId>,
}

impl Lingering {
    const LIMIT: usize = 100;

    pub(crate) fn push(&mut self, id: StreamId) {
        self.refs.push_front(id);
        self.refs.truncate(Self::LIMIT);
    }

    pub(crate) fn contains(&self, id: StreamId) -> bool {
        self.refs.contains(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(v: u64) -> StreamId {
        StreamId::try_from(v).unwrap()
    }

    #[test]
    fn lingering_is_bounded() {
        let mut lingering = Lingering::default();
        for v in 0..150 {
            lingering.push(id(v * 4));
        }
        assert!(lingering.refs.len() <= 100);
        // Most recent first; the oldest fifty fell off.
        assert!(lingering.contains(id(149 * 4)));
        assert!(lingering.contains(id(50 * 4)));
        assert!(!lingering.contains(id(49 * 4)));
    }
}
