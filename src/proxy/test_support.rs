//! In-memory transport double for dispatcher, router and registry tests.

use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};

use crate::error::{ProxyError, ProxyResult};
use crate::proxy::framing::{Frame, FrameDecoder};
use crate::proxy::registry::{ConnectionId, Delivery, Transport};

#[derive(Debug, Default)]
struct State {
    writes: Vec<Bytes>,
    closed: bool,
    close_calls: usize,
    fail_sends: bool,
}

/// Transport that records every write instead of touching a socket.
#[derive(Debug)]
pub(crate) struct RecordingTransport {
    state: Arc<Mutex<State>>,
}

/// Test-side view of a [`RecordingTransport`].
#[derive(Debug, Clone)]
pub(crate) struct TransportTap {
    state: Arc<Mutex<State>>,
}

impl RecordingTransport {
    pub(crate) fn new() -> (Self, TransportTap) {
        let state = Arc::new(Mutex::new(State::default()));
        (
            Self {
                state: Arc::clone(&state),
            },
            TransportTap { state },
        )
    }
}

impl Transport for RecordingTransport {
    fn send(&self, bytes: Bytes) -> ProxyResult<Delivery> {
        let mut state = self.state.lock().unwrap();
        if state.closed || state.fail_sends {
            return Err(ProxyError::ConnectionClosed(ConnectionId::new(0)));
        }
        state.writes.push(bytes);
        let queued_bytes = state.writes.iter().map(Bytes::len).sum();
        Ok(Delivery { queued_bytes })
    }

    fn close(&mut self) {
        let mut state = self.state.lock().unwrap();
        if !state.closed {
            state.closed = true;
            state.close_calls += 1;
        }
    }

    fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }
}

impl TransportTap {
    /// Everything written so far, concatenated.
    pub(crate) fn written(&self) -> Bytes {
        let state = self.state.lock().unwrap();
        let mut all = BytesMut::new();
        for write in &state.writes {
            all.extend_from_slice(write);
        }
        all.freeze()
    }

    /// Decode everything written so far as frames, skipping `skip` leading bytes.
    pub(crate) fn frames_after(&self, skip: usize) -> Vec<Frame> {
        let written = self.written();
        FrameDecoder::default()
            .feed(written.slice(skip..))
            .unwrap()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    pub(crate) fn close_calls(&self) -> usize {
        self.state.lock().unwrap().close_calls
    }

    pub(crate) fn fail_sends(&self) {
        self.state.lock().unwrap().fail_sends = true;
    }
}
