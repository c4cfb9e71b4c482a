use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::config::EngineConfig;
use crate::crypto;
use crate::engine::{DownloadEngine, TaskSnapshot};
use crate::error::{CoreError, ErrorKind};
use crate::segment::SegmentState;
use crate::task::{OutputFormat, PostProcess, TaskId, TaskOptions, TaskStatus};

use support::{FakeMuxer, FakeNet};

pub(crate) mod support {
    use std::collections::{HashMap, HashSet};
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::Duration;

    use crate::error::{CoreError, CoreResult};
    use crate::mux::Muxer;
    use crate::net::{FetchRequest, FetchResponse, NetClient};
    use crate::safety::{StaticResolver, UrlValidator};

    enum Route {
        Body(Vec<u8>),
        Redirect(String),
        Status(u16),
    }

    /// In-memory origin server keyed by absolute URL.
    #[derive(Default)]
    pub(crate) struct FakeNet {
        routes: Mutex<HashMap<String, Route>>,
        failures: Mutex<HashMap<String, usize>>,
        delays: Mutex<HashMap<String, Duration>>,
        hits: Mutex<HashMap<String, usize>>,
        in_flight: Mutex<HashSet<String>>,
        overlapped: AtomicBool,
    }

    impl FakeNet {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn serve(&self, url: &str, body: Vec<u8>) {
            self.routes
                .lock()
                .unwrap()
                .insert(url.to_string(), Route::Body(body));
        }

        pub(crate) fn status(&self, url: &str, code: u16) {
            self.routes
                .lock()
                .unwrap()
                .insert(url.to_string(), Route::Status(code));
        }

        pub(crate) fn redirect(&self, from: &str, to: &str) {
            self.routes
                .lock()
                .unwrap()
                .insert(from.to_string(), Route::Redirect(to.to_string()));
        }

        /// The next `times` requests for `url` fail with a network error.
        pub(crate) fn fail_times(&self, url: &str, times: usize) {
            self.failures.lock().unwrap().insert(url.to_string(), times);
        }

        pub(crate) fn delay(&self, url: &str, delay: Duration) {
            self.delays.lock().unwrap().insert(url.to_string(), delay);
        }

        pub(crate) fn hits(&self, url: &str) -> usize {
            self.hits.lock().unwrap().get(url).copied().unwrap_or(0)
        }

        /// Whether two requests for the same URL were ever in flight together.
        pub(crate) fn overlapped(&self) -> bool {
            self.overlapped.load(Ordering::SeqCst)
        }

        fn respond(&self, url: &str) -> CoreResult<FetchResponse> {
            {
                let mut failures = self.failures.lock().unwrap();
                if let Some(left) = failures.get_mut(url) {
                    if *left > 0 {
                        *left -= 1;
                        return Err(CoreError::Network(format!("injected failure for {url}")));
                    }
                }
            }
            let routes = self.routes.lock().unwrap();
            let resp = match routes.get(url) {
                Some(Route::Body(body)) => FetchResponse {
                    status_code: 200,
                    location: None,
                    content_length: Some(body.len() as u64),
                    body: body.clone(),
                },
                Some(Route::Redirect(to)) => FetchResponse {
                    status_code: 302,
                    location: Some(to.clone()),
                    content_length: None,
                    body: Vec::new(),
                },
                Some(Route::Status(code)) => FetchResponse {
                    status_code: *code,
                    location: None,
                    content_length: None,
                    body: Vec::new(),
                },
                None => FetchResponse {
                    status_code: 404,
                    location: None,
                    content_length: None,
                    body: Vec::new(),
                },
            };
            Ok(resp)
        }
    }

    impl NetClient for FakeNet {
        fn get(&self, req: &FetchRequest) -> CoreResult<FetchResponse> {
            let url = req.url.clone();
            *self.hits.lock().unwrap().entry(url.clone()).or_insert(0) += 1;
            if !self.in_flight.lock().unwrap().insert(url.clone()) {
                self.overlapped.store(true, Ordering::SeqCst);
            }
            let delay = self.delays.lock().unwrap().get(&url).copied();
            if let Some(delay) = delay {
                thread::sleep(delay);
            }
            let result = self.respond(&url);
            self.in_flight.lock().unwrap().remove(&url);
            result
        }
    }

    /// Copies the input to the output, or fails when told to.
    #[derive(Default)]
    pub(crate) struct FakeMuxer {
        pub(crate) fail: bool,
        calls: Mutex<Vec<(PathBuf, PathBuf)>>,
    }

    impl FakeMuxer {
        pub(crate) fn failing() -> Self {
            Self {
                fail: true,
                calls: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    impl Muxer for FakeMuxer {
        fn mux(&self, input: &Path, output: &Path) -> CoreResult<()> {
            self.calls
                .lock()
                .unwrap()
                .push((input.to_path_buf(), output.to_path_buf()));
            if self.fail {
                return Err(CoreError::Muxing("ffmpeg not found".to_string()));
            }
            std::fs::copy(input, output)?;
            Ok(())
        }
    }

    pub(crate) fn validator() -> UrlValidator {
        let resolver = StaticResolver::new()
            .with_host("cdn.example", &["93.184.216.34".parse().unwrap()])
            .with_host("internal.example", &["10.0.0.5".parse().unwrap()]);
        UrlValidator::new(Arc::new(resolver))
    }
}

const PLAYLIST_URL: &str = "https://cdn.example/v/index.m3u8";

fn segment_url(index: usize) -> String {
    format!("https://cdn.example/v/seg{index}.ts")
}

fn payload(index: usize) -> Vec<u8> {
    format!("<segment {index:03}>").repeat(index % 4 + 1).into_bytes()
}

fn media_playlist(count: usize, header: &str) -> String {
    let mut text = String::from("#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:4\n");
    text.push_str(header);
    for index in 0..count {
        text.push_str(&format!("#EXTINF:4.0,\nseg{index}.ts\n"));
    }
    text.push_str("#EXT-X-ENDLIST\n");
    text
}

fn serve_plain(net: &FakeNet, count: usize) {
    net.serve(PLAYLIST_URL, media_playlist(count, "").into_bytes());
    for index in 0..count {
        net.serve(&segment_url(index), payload(index));
    }
}

fn expected(indices: impl Iterator<Item = usize>) -> Vec<u8> {
    indices.flat_map(payload).collect()
}

fn test_config(dir: &Path) -> EngineConfig {
    EngineConfig {
        retry_count: 0,
        retry_backoff: Duration::ZERO,
        output_dir: dir.to_path_buf(),
        ..EngineConfig::default()
    }
}

fn engine_with(config: EngineConfig, net: &Arc<FakeNet>, muxer: Arc<FakeMuxer>) -> DownloadEngine {
    DownloadEngine::new(config)
        .expect("engine")
        .with_net_client(net.clone())
        .with_validator(support::validator())
        .with_muxer(muxer)
}

fn engine(dir: &Path, net: &Arc<FakeNet>) -> DownloadEngine {
    engine_with(test_config(dir), net, Arc::new(FakeMuxer::default()))
}

fn run_to_end(engine: &DownloadEngine, id: &TaskId) -> TaskSnapshot {
    engine.start(id).expect("start failed");
    engine.wait(id).expect("wait failed")
}

fn wait_for(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn test_concurrent_download_writes_segments_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let net = Arc::new(FakeNet::new());
    serve_plain(&net, 12);
    for index in 0..12 {
        // later segments finish first
        net.delay(&segment_url(index), Duration::from_millis(((12 - index) * 3) as u64));
    }
    let engine = engine(dir.path(), &net);

    let id = engine
        .create(TaskOptions::new(PLAYLIST_URL).title("show").concurrency(4))
        .expect("create failed");
    let snapshot = run_to_end(&engine, &id);

    assert_eq!(snapshot.status(), TaskStatus::Completed);
    assert_eq!(snapshot.count(SegmentState::Done), 12);
    let output = dir.path().join("show.ts");
    assert_eq!(snapshot.task.output_path.as_deref(), Some(output.as_path()));
    assert_eq!(fs::read(&output).unwrap(), expected(0..12));
    assert_eq!(snapshot.task.post_process, Some(PostProcess::Skipped));
    assert!(!snapshot.task.temp_path().exists());
    assert!(!net.overlapped());
    assert_eq!(snapshot.progress, 1.0);
    assert_eq!(snapshot.expected_bytes, Some(expected(0..12).len() as u64));
    for index in 0..12 {
        assert_eq!(net.hits(&segment_url(index)), 1);
    }
}

#[test]
fn test_range_downloads_only_selected_segments() {
    let dir = tempfile::tempdir().unwrap();
    let net = Arc::new(FakeNet::new());
    serve_plain(&net, 10);
    let engine = engine(dir.path(), &net);

    let id = engine
        .create(
            TaskOptions::new(PLAYLIST_URL)
                .title("clip")
                .range(2, 5)
                .decrypt(false)
                .concurrency(2),
        )
        .expect("create failed");
    let snapshot = run_to_end(&engine, &id);

    assert_eq!(snapshot.status(), TaskStatus::Completed);
    let indices: Vec<usize> = snapshot.segments.iter().map(|s| s.index).collect();
    assert_eq!(indices, vec![2, 3, 4, 5]);
    assert_eq!(snapshot.count(SegmentState::Done), 4);
    let output = fs::read(dir.path().join("clip.ts")).unwrap();
    assert_eq!(output, expected(2..=5));
    assert_eq!(snapshot.task.bytes_completed, output.len() as u64);
    for index in [0, 1, 6, 7, 8, 9] {
        assert_eq!(net.hits(&segment_url(index)), 0);
    }
}

#[test]
fn test_retry_rejects_segments_that_are_not_failed() {
    let dir = tempfile::tempdir().unwrap();
    let net = Arc::new(FakeNet::new());
    serve_plain(&net, 3);
    let engine = engine(dir.path(), &net);

    let id = engine
        .create(TaskOptions::new(PLAYLIST_URL).range(1, 2))
        .expect("create failed");
    assert!(matches!(engine.retry(&id, 1), Err(CoreError::InvalidState(_))));
    run_to_end(&engine, &id);

    assert!(matches!(engine.retry(&id, 1), Err(CoreError::InvalidState(_))));
    assert!(matches!(
        engine.retry(&id, 0),
        Err(CoreError::SegmentOutOfRange { index: 0, start: 1, end: 2 })
    ));
    assert!(matches!(
        engine.retry(&id, 7),
        Err(CoreError::SegmentOutOfRange { .. })
    ));
    assert_eq!(engine.retry_failed(&id).unwrap(), 0);
    let snapshot = engine.get(&id).unwrap();
    assert_eq!(snapshot.status(), TaskStatus::Completed);
    assert_eq!(snapshot.segment(1).unwrap().retries, 0);
    assert_eq!(net.hits(&segment_url(1)), 1);
}

#[test]
fn test_failed_segment_force_save_and_retry() {
    let dir = tempfile::tempdir().unwrap();
    let net = Arc::new(FakeNet::new());
    serve_plain(&net, 6);
    net.status(&segment_url(3), 500);
    let engine = engine(dir.path(), &net);

    let id = engine
        .create(TaskOptions::new(PLAYLIST_URL).title("show").concurrency(1))
        .expect("create failed");
    let snapshot = run_to_end(&engine, &id);

    assert_eq!(snapshot.status(), TaskStatus::Failed);
    let failed = snapshot.segment(3).unwrap();
    assert_eq!(failed.state, SegmentState::Failed);
    assert_eq!(failed.last_error, Some(ErrorKind::Fetch));
    // lenient policy keeps going past the failure
    assert_eq!(snapshot.count(SegmentState::Done), 5);

    let (partial, bytes) = engine.force_save(&id).expect("force save failed");
    assert_eq!(partial, dir.path().join("show.partial.ts"));
    assert_eq!(bytes, expected(0..3).len() as u64);
    assert_eq!(fs::read(&partial).unwrap(), expected(0..3));

    net.serve(&segment_url(3), payload(3));
    engine.retry(&id, 3).expect("retry failed");
    let snapshot = engine.get(&id).unwrap();
    assert_eq!(snapshot.segment(3).unwrap().state, SegmentState::Pending);
    assert_eq!(snapshot.segment(3).unwrap().retries, 1);
    assert_eq!(snapshot.segment(3).unwrap().last_error, None);

    let snapshot = run_to_end(&engine, &id);
    assert_eq!(snapshot.status(), TaskStatus::Completed);
    assert_eq!(fs::read(dir.path().join("show.ts")).unwrap(), expected(0..6));
    assert_eq!(net.hits(&segment_url(4)), 1);
}

#[test]
fn test_force_save_stops_at_first_pending_segment() {
    let dir = tempfile::tempdir().unwrap();
    let net = Arc::new(FakeNet::new());
    serve_plain(&net, 6);
    net.delay(&segment_url(3), Duration::from_millis(150));
    let engine = engine(dir.path(), &net);

    let id = engine
        .create(TaskOptions::new(PLAYLIST_URL).title("partial").concurrency(1))
        .expect("create failed");
    engine.start(&id).expect("start failed");
    wait_for(|| {
        engine.get(&id).unwrap().segment(3).unwrap().state == SegmentState::Downloading
    });
    engine.pause(&id).expect("pause failed");

    let snapshot = engine.get(&id).unwrap();
    assert_eq!(snapshot.count(SegmentState::Done), 4);
    assert_eq!(snapshot.segment(4).unwrap().state, SegmentState::Pending);
    let (partial, bytes) = engine.force_save(&id).expect("force save failed");
    assert_eq!(bytes, expected(0..4).len() as u64);
    assert_eq!(fs::read(&partial).unwrap(), expected(0..4));

    engine.resume(&id).expect("resume failed");
    let snapshot = engine.wait(&id).unwrap();
    assert_eq!(snapshot.status(), TaskStatus::Completed);
    assert_eq!(fs::read(&partial).unwrap(), expected(0..4));
    assert_eq!(fs::read(dir.path().join("partial.ts")).unwrap(), expected(0..6));
}

#[test]
fn test_read_ahead_is_bounded_behind_a_failed_segment() {
    let dir = tempfile::tempdir().unwrap();
    let net = Arc::new(FakeNet::new());
    serve_plain(&net, 40);
    net.status(&segment_url(0), 500);
    let engine = engine(dir.path(), &net);

    let id = engine
        .create(TaskOptions::new(PLAYLIST_URL).title("gap").concurrency(2))
        .expect("create failed");
    let snapshot = run_to_end(&engine, &id);

    // two workers may run eight segments past the gap, no further
    assert_eq!(snapshot.status(), TaskStatus::Failed);
    assert_eq!(snapshot.count(SegmentState::Failed), 1);
    assert_eq!(snapshot.count(SegmentState::Done), 7);
    assert_eq!(snapshot.count(SegmentState::Pending), 32);
    for index in 8..40 {
        assert_eq!(net.hits(&segment_url(index)), 0);
    }

    net.serve(&segment_url(0), payload(0));
    assert_eq!(engine.retry_failed(&id).unwrap(), 1);
    let snapshot = run_to_end(&engine, &id);
    assert_eq!(snapshot.status(), TaskStatus::Completed);
    assert_eq!(fs::read(dir.path().join("gap.ts")).unwrap(), expected(0..40));
    assert_eq!(net.hits(&segment_url(5)), 1);
}

#[test]
fn test_retry_while_running_lifts_abort() {
    let dir = tempfile::tempdir().unwrap();
    let net = Arc::new(FakeNet::new());
    serve_plain(&net, 6);
    net.delay(&segment_url(0), Duration::from_millis(600));
    net.status(&segment_url(1), 503);
    let config = EngineConfig {
        abort_on_segment_failure: true,
        ..test_config(dir.path())
    };
    let engine = engine_with(config, &net, Arc::new(FakeMuxer::default()));

    let id = engine
        .create(TaskOptions::new(PLAYLIST_URL).title("lifted").concurrency(2))
        .expect("create failed");
    engine.start(&id).expect("start failed");
    wait_for(|| {
        engine.get(&id).unwrap().segment(1).unwrap().state == SegmentState::Failed
    });
    let snapshot = engine.get(&id).unwrap();
    assert_eq!(snapshot.status(), TaskStatus::Running);
    assert_eq!(snapshot.segment(0).unwrap().state, SegmentState::Downloading);

    net.serve(&segment_url(1), payload(1));
    engine.retry(&id, 1).expect("retry failed");
    let snapshot = engine.wait(&id).unwrap();

    assert_eq!(snapshot.status(), TaskStatus::Completed);
    assert_eq!(snapshot.segment(1).unwrap().retries, 1);
    assert_eq!(fs::read(dir.path().join("lifted.ts")).unwrap(), expected(0..6));
    assert_eq!(net.hits(&segment_url(1)), 2);
    assert!(!net.overlapped());
}

#[test]
fn test_transient_failures_are_retried_automatically() {
    let dir = tempfile::tempdir().unwrap();
    let net = Arc::new(FakeNet::new());
    serve_plain(&net, 3);
    net.fail_times(&segment_url(1), 2);
    let config = EngineConfig {
        retry_count: 3,
        ..test_config(dir.path())
    };
    let engine = engine_with(config, &net, Arc::new(FakeMuxer::default()));

    let id = engine.create(TaskOptions::new(PLAYLIST_URL)).expect("create failed");
    let snapshot = run_to_end(&engine, &id);
    assert_eq!(snapshot.status(), TaskStatus::Completed);
    assert_eq!(net.hits(&segment_url(1)), 3);
    assert_eq!(snapshot.segment(1).unwrap().retries, 0);
}

#[test]
fn test_pause_and_resume_match_uninterrupted_run() {
    let dir = tempfile::tempdir().unwrap();
    let net = Arc::new(FakeNet::new());
    serve_plain(&net, 8);
    net.delay(&segment_url(2), Duration::from_millis(150));
    let engine = engine(dir.path(), &net);

    let id = engine
        .create(TaskOptions::new(PLAYLIST_URL).title("paused").concurrency(1))
        .expect("create failed");
    engine.start(&id).expect("start failed");
    wait_for(|| {
        engine.get(&id).unwrap().segment(2).unwrap().state == SegmentState::Downloading
    });
    engine.pause(&id).expect("pause failed");

    let snapshot = engine.get(&id).unwrap();
    assert_eq!(snapshot.status(), TaskStatus::Paused);
    // the in-flight segment settled before pause returned
    assert_eq!(snapshot.segment(2).unwrap().state, SegmentState::Done);
    assert_eq!(snapshot.segment(3).unwrap().state, SegmentState::Pending);
    assert_eq!(snapshot.speed_bps, 0.0);
    assert!(matches!(engine.pause(&id), Err(CoreError::InvalidState(_))));

    engine.resume(&id).expect("resume failed");
    let snapshot = engine.wait(&id).unwrap();
    assert_eq!(snapshot.status(), TaskStatus::Completed);
    assert_eq!(fs::read(dir.path().join("paused.ts")).unwrap(), expected(0..8));
    for index in 0..8 {
        assert_eq!(net.hits(&segment_url(index)), 1);
    }
}

#[test]
fn test_encrypted_playlist_is_decrypted_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let net = Arc::new(FakeNet::new());
    let key = *b"0123456789abcdef";
    let header = "#EXT-X-MEDIA-SEQUENCE:5\n#EXT-X-KEY:METHOD=AES-128,URI=\"/keys/main.key\"\n";
    net.serve(PLAYLIST_URL, media_playlist(4, header).into_bytes());
    net.serve("https://cdn.example/keys/main.key", key.to_vec());
    for index in 0..4 {
        let iv = crypto::derive_iv(5 + index as u64);
        net.serve(&segment_url(index), crypto::encrypt_for_tests(&payload(index), &key, &iv));
    }
    let engine = engine(dir.path(), &net);

    let id = engine
        .create(TaskOptions::new(PLAYLIST_URL).title("secret").concurrency(3))
        .expect("create failed");
    let snapshot = run_to_end(&engine, &id);

    assert_eq!(snapshot.status(), TaskStatus::Completed);
    assert_eq!(fs::read(dir.path().join("secret.ts")).unwrap(), expected(0..4));
    assert_eq!(net.hits("https://cdn.example/keys/main.key"), 1);
}

#[test]
fn test_decrypt_disabled_keeps_ciphertext() {
    let dir = tempfile::tempdir().unwrap();
    let net = Arc::new(FakeNet::new());
    let key = *b"0123456789abcdef";
    let header = "#EXT-X-KEY:METHOD=AES-128,URI=\"/keys/main.key\"\n";
    net.serve(PLAYLIST_URL, media_playlist(2, header).into_bytes());
    let mut raw = Vec::new();
    for index in 0..2 {
        let body = crypto::encrypt_for_tests(&payload(index), &key, &crypto::derive_iv(index as u64));
        raw.extend_from_slice(&body);
        net.serve(&segment_url(index), body);
    }
    let engine = engine(dir.path(), &net);

    let id = engine
        .create(TaskOptions::new(PLAYLIST_URL).title("raw").decrypt(false))
        .expect("create failed");
    run_to_end(&engine, &id);
    assert_eq!(fs::read(dir.path().join("raw.ts")).unwrap(), raw);
    assert_eq!(net.hits("https://cdn.example/keys/main.key"), 0);
}

#[test]
fn test_create_rejects_variant_and_unsafe_playlists() {
    let dir = tempfile::tempdir().unwrap();
    let net = Arc::new(FakeNet::new());
    net.serve(
        PLAYLIST_URL,
        b"#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=800000\nlow/index.m3u8\n".to_vec(),
    );
    let engine = engine(dir.path(), &net);

    assert!(matches!(
        engine.create(TaskOptions::new(PLAYLIST_URL)),
        Err(CoreError::UnsupportedPlaylist(_))
    ));
    for url in [
        "http://internal.example/index.m3u8",
        "http://127.0.0.1/index.m3u8",
        "http://[::1]/index.m3u8",
        "file:///etc/passwd",
    ] {
        assert!(
            matches!(engine.create(TaskOptions::new(url)), Err(CoreError::UnsafeUrl(_))),
            "{url} should be rejected"
        );
        assert_eq!(net.hits(url), 0);
    }
    assert!(engine.list().unwrap().is_empty());
}

#[test]
fn test_create_rejects_range_outside_playlist() {
    let dir = tempfile::tempdir().unwrap();
    let net = Arc::new(FakeNet::new());
    serve_plain(&net, 3);
    let engine = engine(dir.path(), &net);

    assert!(engine
        .create(TaskOptions::new(PLAYLIST_URL).range(1, 3))
        .is_err());
    assert!(engine.list().unwrap().is_empty());
}

#[test]
fn test_redirect_to_private_host_fails_segment() {
    let dir = tempfile::tempdir().unwrap();
    let net = Arc::new(FakeNet::new());
    serve_plain(&net, 3);
    net.redirect(&segment_url(1), "http://internal.example/metadata");
    let engine = engine(dir.path(), &net);

    let id = engine.create(TaskOptions::new(PLAYLIST_URL)).expect("create failed");
    let snapshot = run_to_end(&engine, &id);

    assert_eq!(snapshot.status(), TaskStatus::Failed);
    assert_eq!(snapshot.segment(1).unwrap().last_error, Some(ErrorKind::UnsafeUrl));
    assert_eq!(net.hits("http://internal.example/metadata"), 0);
}

#[test]
fn test_abort_policy_stops_claiming_after_failure() {
    let dir = tempfile::tempdir().unwrap();
    let net = Arc::new(FakeNet::new());
    serve_plain(&net, 5);
    net.status(&segment_url(1), 404);
    let config = EngineConfig {
        abort_on_segment_failure: true,
        ..test_config(dir.path())
    };
    let engine = engine_with(config, &net, Arc::new(FakeMuxer::default()));

    let id = engine
        .create(TaskOptions::new(PLAYLIST_URL).concurrency(1))
        .expect("create failed");
    let snapshot = run_to_end(&engine, &id);

    assert_eq!(snapshot.status(), TaskStatus::Failed);
    assert_eq!(snapshot.count(SegmentState::Done), 1);
    assert_eq!(snapshot.count(SegmentState::Failed), 1);
    assert_eq!(snapshot.count(SegmentState::Pending), 3);
    for index in 2..5 {
        assert_eq!(net.hits(&segment_url(index)), 0);
    }
}

#[test]
fn test_invalid_transitions_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let net = Arc::new(FakeNet::new());
    serve_plain(&net, 2);
    let engine = engine(dir.path(), &net);

    let id = engine.create(TaskOptions::new(PLAYLIST_URL)).expect("create failed");
    assert_eq!(engine.get(&id).unwrap().status(), TaskStatus::Created);
    assert!(matches!(engine.pause(&id), Err(CoreError::InvalidState(_))));
    assert!(matches!(engine.resume(&id), Err(CoreError::InvalidState(_))));

    run_to_end(&engine, &id);
    assert!(matches!(engine.start(&id), Err(CoreError::InvalidState(_))));
    assert!(matches!(engine.resume(&id), Err(CoreError::InvalidState(_))));

    let unknown = TaskId::new();
    assert!(matches!(engine.start(&unknown), Err(CoreError::NotFound(_))));
    assert!(matches!(engine.delete(&unknown, false), Err(CoreError::NotFound(_))));
}

#[test]
fn test_delete_removes_task_and_files() {
    let dir = tempfile::tempdir().unwrap();
    let net = Arc::new(FakeNet::new());
    serve_plain(&net, 3);
    let engine = engine(dir.path(), &net);

    let pending = engine
        .create(TaskOptions::new(PLAYLIST_URL).title("pending"))
        .expect("create failed");
    let temp = engine.get(&pending).unwrap().task.temp_path();
    assert!(temp.exists());
    engine.delete(&pending, false).expect("delete failed");
    assert!(!temp.exists());
    assert!(matches!(engine.get(&pending), Err(CoreError::NotFound(_))));

    let done = engine
        .create(TaskOptions::new(PLAYLIST_URL).title("done"))
        .expect("create failed");
    run_to_end(&engine, &done);
    engine.force_save(&done).expect("force save failed");
    let output = dir.path().join("done.ts");
    let partial = dir.path().join("done.partial.ts");
    assert!(output.exists() && partial.exists());

    engine.delete(&done, true).expect("delete failed");
    assert!(!output.exists());
    assert!(!partial.exists());
    assert!(engine.list().unwrap().is_empty());
}

#[test]
fn test_delete_running_task_stops_workers() {
    let dir = tempfile::tempdir().unwrap();
    let net = Arc::new(FakeNet::new());
    serve_plain(&net, 8);
    for index in 0..8 {
        net.delay(&segment_url(index), Duration::from_millis(100));
    }
    let engine = engine(dir.path(), &net);

    let id = engine
        .create(TaskOptions::new(PLAYLIST_URL).title("cancelled").concurrency(2))
        .expect("create failed");
    let temp = engine.get(&id).unwrap().task.temp_path();
    engine.start(&id).expect("start failed");
    wait_for(|| engine.get(&id).unwrap().count(SegmentState::Done) >= 1);
    engine.delete(&id, true).expect("delete failed");

    assert!(matches!(engine.get(&id), Err(CoreError::NotFound(_))));
    assert!(!temp.exists());
    assert!(!dir.path().join("cancelled.ts").exists());
    let hits: Vec<usize> = (0..8).map(|i| net.hits(&segment_url(i))).collect();
    thread::sleep(Duration::from_millis(250));
    let later: Vec<usize> = (0..8).map(|i| net.hits(&segment_url(i))).collect();
    assert_eq!(hits, later);
    assert_eq!(net.hits(&segment_url(7)), 0);
}

#[cfg(feature = "sqlite")]
#[test]
fn test_deleted_task_stays_deleted_in_sqlite() {
    use crate::storage::SqliteStorage;

    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("tasks.db").to_string_lossy().into_owned();
    let net = Arc::new(FakeNet::new());
    serve_plain(&net, 3);

    {
        let engine = engine(dir.path(), &net)
            .with_storage(Box::new(SqliteStorage::new(db.clone()).expect("db")));
        let id = engine
            .create(TaskOptions::new(PLAYLIST_URL).title("gone"))
            .expect("create failed");
        let temp = engine.get(&id).unwrap().task.temp_path();
        run_to_end(&engine, &id);
        let partial = engine.force_save(&id).expect("force save failed").0;

        engine.delete(&id, true).expect("delete failed");
        assert!(matches!(engine.get(&id), Err(CoreError::NotFound(_))));
        assert!(!temp.exists());
        assert!(!partial.exists());
        assert!(!dir.path().join("gone.ts").exists());
    }

    let engine = engine(dir.path(), &net)
        .with_storage(Box::new(SqliteStorage::new(db).expect("db")));
    assert_eq!(engine.restore().unwrap(), 0);
    assert!(engine.list().unwrap().is_empty());
}

#[test]
fn test_mp4_output_is_muxed() {
    let dir = tempfile::tempdir().unwrap();
    let net = Arc::new(FakeNet::new());
    serve_plain(&net, 3);
    let muxer = Arc::new(FakeMuxer::default());
    let engine = engine_with(test_config(dir.path()), &net, muxer.clone());

    let id = engine
        .create(TaskOptions::new(PLAYLIST_URL).title("movie").format(OutputFormat::Mp4))
        .expect("create failed");
    let snapshot = run_to_end(&engine, &id);

    let mp4 = dir.path().join("movie.mp4");
    assert_eq!(snapshot.status(), TaskStatus::Completed);
    assert_eq!(muxer.calls(), 1);
    assert_eq!(snapshot.task.output_path.as_deref(), Some(mp4.as_path()));
    assert_eq!(
        snapshot.task.post_process,
        Some(PostProcess::Muxed {
            path: mp4.to_string_lossy().into_owned()
        })
    );
    assert_eq!(fs::read(&mp4).unwrap(), expected(0..3));
    assert!(!dir.path().join("movie.ts").exists());

    let (path, bytes) = engine.force_save(&id).expect("force save failed");
    assert_eq!(path, mp4);
    assert_eq!(bytes, expected(0..3).len() as u64);
}

#[test]
fn test_failed_muxing_keeps_transport_stream() {
    let dir = tempfile::tempdir().unwrap();
    let net = Arc::new(FakeNet::new());
    serve_plain(&net, 2);
    let engine = engine_with(test_config(dir.path()), &net, Arc::new(FakeMuxer::failing()));

    let id = engine
        .create(TaskOptions::new(PLAYLIST_URL).title("movie").format(OutputFormat::Mp4))
        .expect("create failed");
    let snapshot = run_to_end(&engine, &id);

    let ts = dir.path().join("movie.ts");
    assert_eq!(snapshot.status(), TaskStatus::Completed);
    assert_eq!(snapshot.task.output_path.as_deref(), Some(ts.as_path()));
    assert!(matches!(
        snapshot.task.post_process,
        Some(PostProcess::Failed { .. })
    ));
    assert_eq!(fs::read(&ts).unwrap(), expected(0..2));
}

#[cfg(feature = "sqlite")]
#[test]
fn test_restore_resumes_from_contiguous_prefix() {
    use crate::storage::SqliteStorage;

    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("tasks.db").to_string_lossy().into_owned();
    let net = Arc::new(FakeNet::new());
    serve_plain(&net, 6);
    net.status(&segment_url(2), 503);

    let id = {
        let engine = engine(dir.path(), &net)
            .with_storage(Box::new(SqliteStorage::new(db.clone()).expect("db")));
        let id = engine
            .create(TaskOptions::new(PLAYLIST_URL).title("restored").concurrency(1))
            .expect("create failed");
        let snapshot = run_to_end(&engine, &id);
        assert_eq!(snapshot.status(), TaskStatus::Failed);
        assert_eq!(snapshot.count(SegmentState::Done), 5);
        id
    };

    let engine = engine(dir.path(), &net)
        .with_storage(Box::new(SqliteStorage::new(db).expect("db")));
    assert_eq!(engine.restore().unwrap(), 1);
    let snapshot = engine.get(&id).unwrap();
    assert_eq!(snapshot.status(), TaskStatus::Failed);
    // segments past the gap were never written to disk
    assert_eq!(snapshot.segment(1).unwrap().state, SegmentState::Done);
    assert_eq!(snapshot.segment(2).unwrap().state, SegmentState::Failed);
    assert_eq!(snapshot.segment(3).unwrap().state, SegmentState::Pending);
    assert_eq!(snapshot.task.bytes_completed, expected(0..2).len() as u64);

    net.serve(&segment_url(2), payload(2));
    assert_eq!(engine.retry_failed(&id).unwrap(), 1);
    let snapshot = run_to_end(&engine, &id);
    assert_eq!(snapshot.status(), TaskStatus::Completed);
    assert_eq!(fs::read(dir.path().join("restored.ts")).unwrap(), expected(0..6));
    assert_eq!(net.hits(&segment_url(0)), 1);
    assert_eq!(net.hits(&segment_url(4)), 2);
}
