use std::io::{self, BufRead, BufReader, Cursor, Read};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use dbsee_api::ApiConfig;
use dbsee_api::stream::{
    BroadSearch, Callbacks, Completed, DirectSearch, ErrorKind, SearchObserver, SearchRequest,
    SearchVariant, Session, Settlement, StreamConsumer, StreamError, Transport,
};

/// Serves a canned event-stream body and counts how often it was opened.
struct Scripted {
    body: String,
    opens: AtomicUsize,
}

impl Scripted {
    fn new(frames: &[&str]) -> Arc<Self> {
        let body = frames
            .iter()
            .map(|frame| format!("data: {}\n\n", frame))
            .collect();
        Arc::new(Self {
            body,
            opens: AtomicUsize::new(0),
        })
    }

    fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

impl Transport for Scripted {
    fn open(
        &self,
        _endpoint: &str,
        _request: &SearchRequest,
        _credential: &str,
    ) -> Result<Box<dyn BufRead + Send>, StreamError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(Cursor::new(self.body.clone().into_bytes())))
    }
}

/// A body that sends nothing for a while, then ends.
struct Stall(Duration);

impl Read for Stall {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        thread::sleep(self.0);
        Ok(0)
    }
}

struct Stalling;

impl Transport for Stalling {
    fn open(
        &self,
        _endpoint: &str,
        _request: &SearchRequest,
        _credential: &str,
    ) -> Result<Box<dyn BufRead + Send>, StreamError> {
        Ok(Box::new(BufReader::new(Stall(Duration::from_secs(5)))))
    }
}

/// A body that never sends anything. Each read gives up after a short wait,
/// the way a bounded HTTP read does, and dropping the body marks it closed.
struct Quiet {
    closed: Arc<AtomicBool>,
}

impl Read for Quiet {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        thread::sleep(Duration::from_millis(20));
        Err(io::Error::new(io::ErrorKind::TimedOut, "no data"))
    }
}

impl Drop for Quiet {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct QuietServer {
    closed: Arc<AtomicBool>,
}

impl QuietServer {
    /// Waits up to `limit` for the body to be dropped.
    fn closed_within(&self, limit: Duration) -> bool {
        let start = Instant::now();
        while start.elapsed() < limit {
            if self.closed.load(Ordering::SeqCst) {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        self.closed.load(Ordering::SeqCst)
    }
}

impl Transport for QuietServer {
    fn open(
        &self,
        _endpoint: &str,
        _request: &SearchRequest,
        _credential: &str,
    ) -> Result<Box<dyn BufRead + Send>, StreamError> {
        Ok(Box::new(BufReader::new(Quiet {
            closed: self.closed.clone(),
        })))
    }
}

/// Sends one frame, then the connection drops.
struct Breaking;

struct Reset;

impl Read for Reset {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::Error::new(
            io::ErrorKind::ConnectionReset,
            "connection reset by peer",
        ))
    }
}

impl Transport for Breaking {
    fn open(
        &self,
        _endpoint: &str,
        _request: &SearchRequest,
        _credential: &str,
    ) -> Result<Box<dyn BufRead + Send>, StreamError> {
        let frame = "data: {\"type\":\"status\",\"message\":\"starting\"}\n\n";
        Ok(Box::new(BufReader::new(Cursor::new(frame).chain(Reset))))
    }
}

struct Rejecting;

impl Transport for Rejecting {
    fn open(
        &self,
        _endpoint: &str,
        _request: &SearchRequest,
        _credential: &str,
    ) -> Result<Box<dyn BufRead + Send>, StreamError> {
        Err(StreamError::AuthError(
            "server rejected the credential (401 Unauthorized)".to_string(),
        ))
    }
}

/// Records every notification in order.
struct Recorder<V> {
    progress: Vec<V>,
    completed: Vec<Completed<V>>,
    errors: Vec<StreamError>,
}

impl<V> Default for Recorder<V> {
    fn default() -> Self {
        Self {
            progress: Vec::new(),
            completed: Vec::new(),
            errors: Vec::new(),
        }
    }
}

impl<V> Recorder<V> {
    fn terminal_count(&self) -> usize {
        self.completed.len() + self.errors.len()
    }
}

impl<V: Clone> SearchObserver<V> for Recorder<V> {
    fn on_progress(&mut self, state: &V) {
        self.progress.push(state.clone());
    }

    fn on_complete(&mut self, completed: Completed<V>) {
        self.completed.push(completed);
    }

    fn on_error(&mut self, error: StreamError) {
        self.errors.push(error);
    }
}

fn consumer(transport: Arc<dyn Transport>) -> StreamConsumer {
    StreamConsumer::new(transport, ApiConfig::default())
}

fn acme() -> SearchRequest {
    SearchRequest::new("ACME", Some(2023))
}

const SUMMARY: &str = r#"{"type":"final_summary","company_name":"ACME","year_filter":2023,"found":true,"total_matches":2,"tables_searched":3,"search_timestamp":"2024-01-01T00:00:00"}"#;

#[test]
fn broad_search_streams_progress_then_completes() {
    let transport = Scripted::new(&[
        r#"{"type":"progress","current_table":"cig_data","table_index":0,"total_tables":3}"#,
        r#"{"type":"table_result","table_name":"cig_data","matches":2,"data":[{"cig":"Z1","anno":2023},{"cig":"Z2","anno":2023}]}"#,
        r#"{"type":"status","message":"searching lotti_data"}"#,
        r#"{"type":"table_result","table_name":"lotti_data","matches":0,"data":[]}"#,
        SUMMARY,
    ]);
    let mut recorder = Recorder::<BroadSearch>::default();
    let settlement = consumer(transport.clone()).run::<BroadSearch, _>(
        &acme(),
        Some("token"),
        &mut recorder,
    );

    assert_eq!(settlement, Settlement::Completed);
    assert_eq!(transport.opens(), 1);
    assert!(recorder.errors.is_empty());

    let totals: Vec<u64> = recorder
        .progress
        .iter()
        .map(|state| state.result.total_matches())
        .collect();
    assert_eq!(totals, [0, 2, 2, 2]);
    assert_eq!(
        recorder.progress[2].status.as_deref(),
        Some("searching lotti_data")
    );

    assert_eq!(recorder.completed.len(), 1);
    let completed = &recorder.completed[0];
    assert_eq!(completed.summary.total_matches, 2);
    assert_eq!(completed.summary.tables_searched, 3);
    assert!(completed.summary.found);
    assert_eq!(completed.state.result.total_matches(), 2);
    assert_eq!(completed.state.result.per_table_results().len(), 2);
    assert_eq!(completed.state.result.query(), "ACME");
    assert_eq!(completed.state.result.year_filter(), Some(2023));
    assert!(completed.state.progress.is_none());
}

#[test]
fn summary_tables_searched_is_reported_as_sent() {
    let transport = Scripted::new(&[
        r#"{"type":"progress","current_table":"a","table_index":0,"total_tables":12,"is_priority":true,"priority_tables":2}"#,
        r#"{"type":"table_result","table_name":"a","matches":5,"data":[]}"#,
        r#"{"type":"table_result","table_name":"b","matches":3,"data":[]}"#,
        r#"{"type":"final_summary","company_name":"ACME","found":true,"total_matches":8,"tables_searched":12,"search_timestamp":"t"}"#,
    ]);
    let mut recorder = Recorder::<BroadSearch>::default();
    consumer(transport).run::<BroadSearch, _>(&acme(), Some("token"), &mut recorder);

    let completed = &recorder.completed[0];
    assert_eq!(completed.state.result.total_matches(), 8);
    assert_eq!(completed.summary.tables_searched, 12);
}

#[test]
fn missing_credential_fails_without_opening_the_channel() {
    for credential in [None, Some(""), Some("   ")] {
        let transport = Scripted::new(&[SUMMARY]);
        let mut recorder = Recorder::<BroadSearch>::default();
        let settlement =
            consumer(transport.clone()).run::<BroadSearch, _>(&acme(), credential, &mut recorder);

        assert_eq!(settlement, Settlement::Failed);
        assert_eq!(transport.opens(), 0);
        assert!(recorder.progress.is_empty());
        assert_eq!(recorder.errors.len(), 1);
        assert_eq!(recorder.errors[0].kind(), ErrorKind::AuthRequired);
    }
}

#[test]
fn malformed_frame_fails_once_and_drops_the_rest() {
    let transport = Scripted::new(&[
        r#"{"type":"progress","current_table":"cig_data","table_index":0,"total_tables":3}"#,
        "{not json",
        r#"{"type":"table_result","table_name":"cig_data","matches":2,"data":[]}"#,
        SUMMARY,
    ]);
    let mut recorder = Recorder::<BroadSearch>::default();
    let settlement =
        consumer(transport).run::<BroadSearch, _>(&acme(), Some("token"), &mut recorder);

    assert_eq!(settlement, Settlement::Failed);
    assert_eq!(recorder.progress.len(), 1);
    assert!(recorder.completed.is_empty());
    assert_eq!(recorder.errors.len(), 1);
    assert_eq!(recorder.errors[0].kind(), ErrorKind::Error);
    assert!(matches!(recorder.errors[0], StreamError::Parse(_)));
}

#[test]
fn silent_stream_times_out() {
    let config = ApiConfig {
        broad_search_timeout: Duration::from_millis(100),
        ..ApiConfig::default()
    };
    let consumer = StreamConsumer::new(Arc::new(Stalling), config);
    let mut recorder = Recorder::<BroadSearch>::default();
    let settlement = consumer.run::<BroadSearch, _>(&acme(), Some("token"), &mut recorder);

    assert_eq!(settlement, Settlement::Failed);
    assert_eq!(recorder.errors.len(), 1);
    let error = &recorder.errors[0];
    assert_eq!(error.kind(), ErrorKind::Error);
    assert!(error.to_string().to_lowercase().contains("timeout"));
    assert!(recorder.completed.is_empty());
}

#[test]
fn quiet_channel_is_closed_when_the_search_times_out() {
    let server = Arc::new(QuietServer::default());
    let config = ApiConfig {
        broad_search_timeout: Duration::from_millis(100),
        ..ApiConfig::default()
    };
    let consumer = StreamConsumer::new(server.clone(), config);
    let mut recorder = Recorder::<BroadSearch>::default();
    let settlement = consumer.run::<BroadSearch, _>(&acme(), Some("token"), &mut recorder);

    assert_eq!(settlement, Settlement::Failed);
    assert_eq!(
        recorder.errors,
        [StreamError::Timeout(Duration::from_millis(100))]
    );
    assert!(server.closed_within(Duration::from_millis(500)));
}

#[test]
fn cancelled_search_closes_its_channel() {
    let server = Arc::new(QuietServer::default());
    let handle = consumer(server.clone()).spawn::<BroadSearch, _>(
        acme(),
        Some("token".to_string()),
        Recorder::<BroadSearch>::default(),
    );
    handle.cancel();

    let (settlement, _) = handle.join().unwrap();
    assert_eq!(settlement, Settlement::Cancelled);
    assert!(server.closed_within(Duration::from_millis(500)));
}

#[test]
fn read_error_mid_stream_fails_once() {
    let mut recorder = Recorder::<BroadSearch>::default();
    let settlement =
        consumer(Arc::new(Breaking)).run::<BroadSearch, _>(&acme(), Some("token"), &mut recorder);

    assert_eq!(settlement, Settlement::Failed);
    assert_eq!(recorder.progress.len(), 1);
    assert!(recorder.completed.is_empty());
    assert_eq!(recorder.errors.len(), 1);
    let StreamError::Transport(reason) = &recorder.errors[0] else {
        panic!("expected a transport error, got {:?}", recorder.errors[0]);
    };
    assert!(reason.contains("connection reset"), "{reason}");
}

#[test]
fn stream_closing_without_summary_is_a_transport_error() {
    let transport = Scripted::new(&[r#"{"type":"status","message":"starting"}"#]);
    let mut recorder = Recorder::<BroadSearch>::default();
    let settlement =
        consumer(transport).run::<BroadSearch, _>(&acme(), Some("token"), &mut recorder);

    assert_eq!(settlement, Settlement::Failed);
    assert_eq!(recorder.progress.len(), 1);
    assert!(matches!(recorder.errors[..], [StreamError::Transport(_)]));
}

#[test]
fn server_error_frames_keep_their_kind() {
    let cases = [
        (
            r#"{"type":"auth_error","message":"Authentication failed"}"#,
            ErrorKind::AuthError,
        ),
        (
            r#"{"type":"auth_required","message":"Authentication token required"}"#,
            ErrorKind::AuthRequired,
        ),
        (
            r#"{"type":"error","message":"Search failed","detail":"connection reset"}"#,
            ErrorKind::Error,
        ),
    ];
    for (frame, kind) in cases {
        let transport = Scripted::new(&[frame, SUMMARY]);
        let mut recorder = Recorder::<BroadSearch>::default();
        consumer(transport).run::<BroadSearch, _>(&acme(), Some("token"), &mut recorder);

        assert_eq!(recorder.terminal_count(), 1, "{frame}");
        assert_eq!(recorder.errors[0].kind(), kind);
    }
}

#[test]
fn rejected_channel_reports_auth_error() {
    let mut recorder = Recorder::<DirectSearch>::default();
    let settlement = consumer(Arc::new(Rejecting)).run::<DirectSearch, _>(
        &acme(),
        Some("expired"),
        &mut recorder,
    );

    assert_eq!(settlement, Settlement::Failed);
    assert_eq!(recorder.errors.len(), 1);
    assert_eq!(recorder.errors[0].kind(), ErrorKind::AuthError);
}

#[test]
fn exactly_one_terminal_callback_per_search() {
    let scripts: [&[&str]; 4] = [
        &[SUMMARY, r#"{"type":"error","message":"late"}"#],
        &[r#"{"type":"error","message":"early"}"#, SUMMARY],
        &[SUMMARY, SUMMARY],
        &[],
    ];
    for frames in scripts {
        let transport = Scripted::new(frames);
        let mut recorder = Recorder::<BroadSearch>::default();
        consumer(transport).run::<BroadSearch, _>(&acme(), Some("token"), &mut recorder);
        assert_eq!(recorder.terminal_count(), 1, "{frames:?}");
    }
}

#[test]
fn session_ignores_frames_after_settlement() {
    let mut session = Session::<BroadSearch>::new();
    let mut recorder = Recorder::<BroadSearch>::default();

    assert!(session.connect(&acme(), Some("token"), &mut recorder).is_none());
    assert_eq!(
        session.handle_frame(SUMMARY, &mut recorder),
        Some(Settlement::Completed)
    );
    assert!(session.phase().is_terminal());
    assert!(session.state().is_none());

    let late = r#"{"type":"table_result","table_name":"x","matches":9,"data":[]}"#;
    assert_eq!(session.handle_frame(late, &mut recorder), None);
    assert!(recorder.progress.is_empty());
    assert_eq!(recorder.terminal_count(), 1);
}

#[test]
fn cancelled_search_settles_silently() {
    let consumer = consumer(Arc::new(Stalling));
    let handle = consumer.spawn::<BroadSearch, _>(
        acme(),
        Some("token".to_string()),
        Recorder::<BroadSearch>::default(),
    );
    handle.cancel();

    let (settlement, recorder) = handle.join().unwrap();
    assert_eq!(settlement, Settlement::Cancelled);
    assert!(recorder.progress.is_empty());
    assert_eq!(recorder.terminal_count(), 0);
}

#[test]
fn each_search_starts_from_a_fresh_accumulator() {
    let transport = Scripted::new(&[
        r#"{"type":"table_result","table_name":"cig_data","matches":2,"data":[]}"#,
        SUMMARY,
    ]);
    let consumer = consumer(transport.clone());
    for _ in 0..2 {
        let mut recorder = Recorder::<BroadSearch>::default();
        consumer.run::<BroadSearch, _>(&acme(), Some("token"), &mut recorder);
        assert_eq!(recorder.completed[0].state.result.total_matches(), 2);
    }
    assert_eq!(transport.opens(), 2);
}

#[test]
fn direct_search_collects_awardees_and_cig_details() {
    let transport = Scripted::new(&[
        r#"{"type":"search_started","company_name":"ACME","year_filter":2023,"method":"direct_streaming"}"#,
        r#"{"type":"progress","message":"Searching aggiudicatari_data","step":1}"#,
        r#"{"type":"aggiudicatari_results","matches_found":2,"search_time":0.3,"data":[{"cig":"Z1"},{"cig":"Z2"}]}"#,
        r#"{"type":"cig_progress","message":"Processing CIG 1/2","cig":"Z1","progress":1,"total":2}"#,
        r#"{"type":"cig_detail","cig":"Z1","data":{"cig":"Z1","importo":100}}"#,
        r#"{"type":"cig_no_data","cig":"Z2"}"#,
        r#"{"type":"final_summary","company_name":"ACME","year_filter":2023,"found":true,"search_method":"direct_streaming","aggiudicatari_matches":2,"unique_cigs":2,"total_cig_details":1,"search_time":1.5,"search_timestamp":"t"}"#,
    ]);
    let mut recorder = Recorder::<DirectSearch>::default();
    let settlement = consumer(transport).run::<DirectSearch, _>(
        &acme(),
        Some("token"),
        &mut recorder,
    );

    assert_eq!(settlement, Settlement::Completed);
    assert_eq!(recorder.progress.len(), 6);
    let completed = &recorder.completed[0];
    let state = &completed.state;
    assert_eq!(state.company_name, "ACME");
    assert_eq!(state.awardees.as_ref().map(|a| a.matches_found), Some(2));
    assert_eq!(state.cig_details.len(), 1);
    assert_eq!(state.cig_details[0].data["importo"], 100);
    assert_eq!(state.cig_misses.len(), 1);
    assert_eq!(state.cig_progress.as_ref().map(|p| p.processed), Some(1));
    assert_eq!(completed.summary.unique_cigs, Some(2));

    let statuses: Vec<Option<String>> = recorder.progress.iter().map(|s| s.status.clone()).collect();
    insta::assert_json_snapshot!(statuses, @r#"
    [
      "Searching ACME",
      "Searching aggiudicatari_data",
      "Found 2 matches in aggiudicatari_data",
      "Processing CIG 1/2",
      "Processing CIG 1/2",
      "Processing CIG 1/2"
    ]
    "#);
}

#[test]
fn closure_callbacks_observe_in_order() {
    let transport = Scripted::new(&[
        r#"{"type":"table_result","table_name":"a","matches":1,"data":[]}"#,
        r#"{"type":"heartbeat"}"#,
        SUMMARY,
    ]);
    let mut seen = Vec::new();
    {
        let seen = std::cell::RefCell::new(&mut seen);
        let mut callbacks = Callbacks {
            on_progress: |state: &BroadSearch| {
                seen.borrow_mut()
                    .push(format!("progress {}", state.result.total_matches()))
            },
            on_complete: |completed: Completed<BroadSearch>| {
                seen.borrow_mut()
                    .push(format!("complete {}", completed.summary.total_matches))
            },
            on_error: |error: StreamError| seen.borrow_mut().push(format!("error {}", error)),
        };
        consumer(transport).run::<BroadSearch, _>(&acme(), Some("token"), &mut callbacks);
    }
    assert_eq!(seen, ["progress 1", "progress 1", "complete 2"]);
}

#[test]
fn variants_pick_their_own_budget() {
    let config = ApiConfig::default();
    assert_eq!(BroadSearch::timeout(&config), Duration::from_secs(300));
    assert_eq!(DirectSearch::timeout(&config), Duration::from_secs(120));
    assert!(BroadSearch::timeout(&config) > DirectSearch::timeout(&config));
}
