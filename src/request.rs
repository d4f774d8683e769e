//! Upstream request model: asynchronous submissions completed through a
//! waitable handle that is also a `Future`.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex};
use std::task::{Context, Poll, Waker};

use crate::error::RemapError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoKind {
    Read,
    Write,
    Flush,
    Discard,
}

/// One upstream I/O against logical sectors `[sector, sector + n_sectors)`.
#[derive(Debug, Clone)]
pub struct IoRequest {
    pub kind: IoKind,
    pub sector: u64,
    pub n_sectors: u64,
    /// Write payload; must be `n_sectors * SECTOR_SIZE` bytes for writes,
    /// empty otherwise.
    pub payload: Vec<u8>,
}

impl IoRequest {
    pub fn read(sector: u64, n_sectors: u64) -> Self {
        Self {
            kind: IoKind::Read,
            sector,
            n_sectors,
            payload: Vec::new(),
        }
    }

    pub fn write(sector: u64, payload: Vec<u8>) -> Self {
        let n_sectors = (payload.len() / crate::device::SECTOR_SIZE) as u64;
        Self {
            kind: IoKind::Write,
            sector,
            n_sectors,
            payload,
        }
    }

    pub fn flush() -> Self {
        Self {
            kind: IoKind::Flush,
            sector: 0,
            n_sectors: 0,
            payload: Vec::new(),
        }
    }

    pub fn discard(sector: u64, n_sectors: u64) -> Self {
        Self {
            kind: IoKind::Discard,
            sector,
            n_sectors,
            payload: Vec::new(),
        }
    }
}

/// Payload of a finished request: read data for reads, empty for the rest.
pub type IoOutcome = Result<Vec<u8>, RemapError>;

struct CompletionState {
    result: Option<IoOutcome>,
    waker: Option<Waker>,
}

struct CompletionInner {
    state: Mutex<CompletionState>,
    cv: Condvar,
}

/// Caller-side handle for one submitted request. `wait` blocks; polling as a
/// `Future` integrates with an async caller. Dropping the handle cancels
/// nothing: the engine finishes the request and discards the result, and any
/// remap it installed along the way is kept.
pub struct Completion {
    inner: Arc<CompletionInner>,
}

impl Completion {
    pub(crate) fn new() -> (Completion, CompletionHandle) {
        let inner = Arc::new(CompletionInner {
            state: Mutex::new(CompletionState {
                result: None,
                waker: None,
            }),
            cv: Condvar::new(),
        });
        (
            Completion {
                inner: Arc::clone(&inner),
            },
            CompletionHandle { inner },
        )
    }

    /// Blocks until the request finishes.
    pub fn wait(self) -> IoOutcome {
        let mut state = self.inner.state.lock().unwrap();
        loop {
            if let Some(result) = state.result.take() {
                return result;
            }
            state = self.inner.cv.wait(state).unwrap();
        }
    }

    pub fn is_done(&self) -> bool {
        self.inner.state.lock().unwrap().result.is_some()
    }
}

impl Future for Completion {
    type Output = IoOutcome;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.inner.state.lock().unwrap();
        if let Some(result) = state.result.take() {
            return Poll::Ready(result);
        }
        state.waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

/// Engine-side half: owns the per-request state until completion.
pub(crate) struct CompletionHandle {
    inner: Arc<CompletionInner>,
}

impl CompletionHandle {
    pub(crate) fn complete(self, result: IoOutcome) {
        let mut state = self.inner.state.lock().unwrap();
        state.result = Some(result);
        if let Some(waker) = state.waker.take() {
            waker.wake();
        }
        self.inner.cv.notify_all();
    }
}
