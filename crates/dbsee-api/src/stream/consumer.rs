use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::error::StreamError;
use super::event::{FinalSummary, Frame, SearchRequest, decode_frame};
use super::sse::read_frames;
use super::transport::Transport;
use crate::config::ApiConfig;

/// The per-variant half of a streaming search: which endpoint to open, how
/// long to wait, and how each non-terminal tag changes the accumulated state.
pub trait SearchVariant: Default + Send + 'static {
    type Update: DeserializeOwned + fmt::Debug + Send;

    /// Path segment under `/search/`.
    const ENDPOINT: &'static str;

    fn timeout(config: &ApiConfig) -> Duration;

    /// Called once before the channel opens.
    fn begin(&mut self, request: &SearchRequest);

    fn apply(&mut self, update: Self::Update);

    /// Merges the terminal summary into the accumulated state.
    fn finish(&mut self, summary: &FinalSummary);
}

/// Final payload handed to `on_complete`.
#[derive(Debug, Clone)]
pub struct Completed<V> {
    pub summary: FinalSummary,
    pub state: V,
}

/// Receives the notifications of one search, in wire order.
///
/// `on_progress` fires for every non-terminal frame with the state after the
/// frame was applied. Exactly one of `on_complete` and `on_error` fires per
/// search, except when the caller cancels, in which case neither does.
pub trait SearchObserver<V> {
    fn on_progress(&mut self, state: &V);
    fn on_complete(&mut self, completed: Completed<V>);
    fn on_error(&mut self, error: StreamError);
}

/// Closure-backed observer.
pub struct Callbacks<P, C, E> {
    pub on_progress: P,
    pub on_complete: C,
    pub on_error: E,
}

impl<V, P, C, E> SearchObserver<V> for Callbacks<P, C, E>
where
    P: FnMut(&V),
    C: FnMut(Completed<V>),
    E: FnMut(StreamError),
{
    fn on_progress(&mut self, state: &V) {
        (self.on_progress)(state)
    }

    fn on_complete(&mut self, completed: Completed<V>) {
        (self.on_complete)(completed)
    }

    fn on_error(&mut self, error: StreamError) {
        (self.on_error)(error)
    }
}

/// How a search ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Connecting,
    Streaming,
    Completed,
    Failed,
    Cancelled,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// What the reader thread (or the caller) pushes at the driver.
#[derive(Debug)]
pub(crate) enum Incoming {
    Frame(String),
    Rejected(StreamError),
    Broken(String),
    Closed,
    TimedOut(Duration),
    Cancelled,
}

/// State machine for one search. Owns the accumulator exclusively; once it
/// reaches a terminal phase every further input is dropped.
pub struct Session<V: SearchVariant> {
    phase: Phase,
    state: Option<V>,
}

impl<V: SearchVariant> Default for Session<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: SearchVariant> Session<V> {
    pub fn new() -> Self {
        Self {
            phase: Phase::Idle,
            state: Some(V::default()),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Accumulated state so far; `None` once completion handed it off.
    pub fn state(&self) -> Option<&V> {
        self.state.as_ref()
    }

    /// Credential check and `Idle -> Connecting`. A missing credential fails
    /// the session immediately.
    pub fn connect<O: SearchObserver<V>>(
        &mut self,
        request: &SearchRequest,
        credential: Option<&str>,
        observer: &mut O,
    ) -> Option<Settlement> {
        if self.phase != Phase::Idle {
            log::warn!("Session already started ({:?}), ignoring connect", self.phase);
            return None;
        }
        if credential.is_none_or(|token| token.trim().is_empty()) {
            return Some(self.fail(
                StreamError::AuthRequired("No authentication token available".to_string()),
                observer,
            ));
        }
        if let Some(state) = self.state.as_mut() {
            state.begin(request);
        }
        self.phase = Phase::Connecting;
        None
    }

    /// Feeds one raw frame payload.
    pub fn handle_frame<O: SearchObserver<V>>(
        &mut self,
        payload: &str,
        observer: &mut O,
    ) -> Option<Settlement> {
        if self.phase.is_terminal() {
            log::debug!("Dropping frame received after settlement: {}", payload);
            return None;
        }

        match decode_frame::<V::Update>(payload) {
            Ok(Frame::Update(update)) => {
                log::trace!("{} update: {:?}", V::ENDPOINT, update);
                self.phase = Phase::Streaming;
                if let Some(state) = self.state.as_mut() {
                    state.apply(update);
                    observer.on_progress(state);
                }
                None
            }
            Ok(Frame::Summary(summary)) => Some(self.complete(summary, observer)),
            Ok(Frame::Failure(error)) => Some(self.fail(error, observer)),
            Err(error) => {
                log::error!("Error parsing stream frame {:?}: {}", payload, error);
                Some(self.fail(error, observer))
            }
        }
    }

    pub(crate) fn handle<O: SearchObserver<V>>(
        &mut self,
        incoming: Incoming,
        observer: &mut O,
    ) -> Option<Settlement> {
        if self.phase.is_terminal() {
            return None;
        }
        match incoming {
            Incoming::Frame(payload) => self.handle_frame(&payload, observer),
            Incoming::Rejected(error) => Some(self.fail(error, observer)),
            Incoming::Broken(reason) => Some(self.fail(StreamError::Transport(reason), observer)),
            Incoming::Closed => Some(self.fail(
                StreamError::Transport("stream closed before a final summary".to_string()),
                observer,
            )),
            Incoming::TimedOut(budget) => Some(self.fail(StreamError::Timeout(budget), observer)),
            Incoming::Cancelled => {
                log::info!("{} search cancelled", V::ENDPOINT);
                self.phase = Phase::Cancelled;
                Some(Settlement::Cancelled)
            }
        }
    }

    fn complete<O: SearchObserver<V>>(
        &mut self,
        summary: FinalSummary,
        observer: &mut O,
    ) -> Settlement {
        self.phase = Phase::Completed;
        let mut state = self.state.take().unwrap_or_default();
        state.finish(&summary);
        log::info!(
            "{} search for {:?} completed: found={}, total_matches={}",
            V::ENDPOINT,
            summary.company_name,
            summary.found,
            summary.total_matches
        );
        observer.on_complete(Completed { summary, state });
        Settlement::Completed
    }

    fn fail<O: SearchObserver<V>>(&mut self, error: StreamError, observer: &mut O) -> Settlement {
        log::warn!("{} search failed ({}): {}", V::ENDPOINT, error.kind(), error);
        self.phase = Phase::Failed;
        observer.on_error(error);
        Settlement::Failed
    }
}

/// Opens search streams and drives them to settlement.
#[derive(Clone)]
pub struct StreamConsumer {
    transport: Arc<dyn Transport>,
    config: ApiConfig,
}

impl StreamConsumer {
    pub fn new(transport: Arc<dyn Transport>, config: ApiConfig) -> Self {
        Self { transport, config }
    }

    pub fn config(&self) -> &ApiConfig {
        &self.config
    }

    /// Runs one search to settlement on the calling thread.
    pub fn run<V, O>(
        &self,
        request: &SearchRequest,
        credential: Option<&str>,
        observer: &mut O,
    ) -> Settlement
    where
        V: SearchVariant,
        O: SearchObserver<V>,
    {
        let (tx, rx) = mpsc::channel();
        self.drive::<V, O>(request, credential, observer, tx, rx)
    }

    /// Runs one search on a worker thread. The returned handle cancels the
    /// search or waits for it and gives the observer back.
    pub fn spawn<V, O>(
        &self,
        request: SearchRequest,
        credential: Option<String>,
        mut observer: O,
    ) -> SearchHandle<O>
    where
        V: SearchVariant,
        O: SearchObserver<V> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let cancel = CancelHandle { tx: tx.clone() };
        let consumer = self.clone();
        let worker = thread::spawn(move || {
            let settlement =
                consumer.drive::<V, O>(&request, credential.as_deref(), &mut observer, tx, rx);
            (settlement, observer)
        });
        SearchHandle { cancel, worker }
    }

    fn drive<V, O>(
        &self,
        request: &SearchRequest,
        credential: Option<&str>,
        observer: &mut O,
        tx: Sender<Incoming>,
        rx: Receiver<Incoming>,
    ) -> Settlement
    where
        V: SearchVariant,
        O: SearchObserver<V>,
    {
        let mut session = Session::<V>::new();
        if let Some(settlement) = session.connect(request, credential, observer) {
            return settlement;
        }
        let credential = credential.unwrap_or_default().trim().to_string();

        let budget = V::timeout(&self.config);
        let deadline = Instant::now() + budget;
        log::info!(
            "Opening {} stream for {:?} (year: {:?}, timeout: {:?})",
            V::ENDPOINT,
            request.query(),
            request.year_filter(),
            budget
        );
        let channel = ChannelGuard::default();
        spawn_reader(
            self.transport.clone(),
            V::ENDPOINT,
            request.clone(),
            credential,
            channel.closed.clone(),
            tx,
        );

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let incoming = match rx.recv_timeout(remaining) {
                Ok(incoming) => incoming,
                Err(RecvTimeoutError::Timeout) => Incoming::TimedOut(budget),
                Err(RecvTimeoutError::Disconnected) => Incoming::Closed,
            };
            if let Some(settlement) = session.handle(incoming, observer) {
                // `channel` drops here and the reader closes the response.
                return settlement;
            }
        }
    }
}

/// Marks the search channel closed once the driver returns, however the
/// search settled.
#[derive(Default)]
struct ChannelGuard {
    closed: Arc<AtomicBool>,
}

impl Drop for ChannelGuard {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Release);
    }
}

fn spawn_reader(
    transport: Arc<dyn Transport>,
    endpoint: &'static str,
    request: SearchRequest,
    credential: String,
    closed: Arc<AtomicBool>,
    tx: Sender<Incoming>,
) {
    thread::spawn(move || {
        let reader = match transport.open(endpoint, &request, &credential) {
            Ok(reader) => reader,
            Err(error) => {
                let _ = tx.send(Incoming::Rejected(error));
                return;
            }
        };

        let mut open = true;
        let result = read_frames(reader, &closed, |payload| {
            open = tx.send(Incoming::Frame(payload)).is_ok();
            open
        });
        // The body is dropped by now, which closes the connection.
        if !open || closed.load(Ordering::Acquire) {
            log::debug!("{} stream closed after settlement", endpoint);
            return;
        }
        let _ = match result {
            Ok(()) => tx.send(Incoming::Closed),
            Err(e) => tx.send(Incoming::Broken(e.to_string())),
        };
    });
}

/// Cancels an in-flight search. Cloneable so it can be moved into a signal handler.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Sender<Incoming>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(Incoming::Cancelled);
    }
}

pub struct SearchHandle<O> {
    cancel: CancelHandle,
    worker: JoinHandle<(Settlement, O)>,
}

impl<O> SearchHandle<O> {
    pub fn canceller(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.worker.is_finished()
    }

    pub fn join(self) -> anyhow::Result<(Settlement, O)> {
        self.worker
            .join()
            .map_err(|_| anyhow::anyhow!("search worker panicked"))
    }
}
