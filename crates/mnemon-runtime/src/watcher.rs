use crate::Result;
use crate::config::WatcherConfig;
use chrono::{DateTime, Utc};
use mnemon_types::read_session_file;
use notify::{PollWatcher, RecursiveMode, Watcher};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::channel;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant, SystemTime};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// File went stable with a new leaf entry; ready for segmentation.
    SessionReady(PathBuf),
    /// No change for the idle window.
    SessionIdle(PathBuf),
    Error(String),
}

#[derive(Debug, Clone)]
pub struct WatcherSettings {
    pub poll_interval: Duration,
    pub stability_window: Duration,
    pub idle_window: Duration,
    pub event_buffer: usize,
}

impl From<&WatcherConfig> for WatcherSettings {
    fn from(config: &WatcherConfig) -> Self {
        Self {
            poll_interval: Duration::from_secs(config.poll_interval_secs.max(1)),
            stability_window: Duration::from_secs(config.stability_window_secs),
            idle_window: Duration::from_secs(config.idle_window_secs),
            event_buffer: config.event_buffer.max(16),
        }
    }
}

/// Tracked state for one session file.
#[derive(Debug, Clone)]
struct FileState {
    first_seen_at: DateTime<Utc>,
    last_modified_at: SystemTime,
    last_size: u64,
    last_entry_id: Option<String>,
    is_stable: bool,
    notified: bool,
    last_change: Instant,
    idle_notified: bool,
    error_emitted: bool,
}

#[derive(Debug, Clone, Default)]
pub struct WatcherStatus {
    pub tracked_files: usize,
    pub overflow_count: u64,
}

/// Bounded event channel with a drop-oldest overflow policy. The watcher
/// never blocks on slow consumers; dropped events are only a latency hit
/// because readiness is re-derived from file state on the next poll.
struct EventBuffer {
    queue: Mutex<VecDeque<WatchEvent>>,
    condvar: Condvar,
    capacity: usize,
    overflow: AtomicU64,
}

impl EventBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            condvar: Condvar::new(),
            capacity,
            overflow: AtomicU64::new(0),
        }
    }

    fn push(&self, event: WatchEvent) {
        let mut queue = self.queue.lock().unwrap_or_else(|p| p.into_inner());
        if queue.len() == self.capacity {
            queue.pop_front();
            self.overflow.fetch_add(1, Ordering::Relaxed);
        }
        queue.push_back(event);
        self.condvar.notify_one();
    }

    fn pop(&self, timeout: Duration) -> Option<WatchEvent> {
        let deadline = Instant::now() + timeout;
        let mut queue = self.queue.lock().unwrap_or_else(|p| p.into_inner());
        loop {
            if let Some(event) = queue.pop_front() {
                return Some(event);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let (guard, _) = self
                .condvar
                .wait_timeout(queue, remaining)
                .unwrap_or_else(|p| p.into_inner());
            queue = guard;
        }
    }

    fn overflow_count(&self) -> u64 {
        self.overflow.load(Ordering::Relaxed)
    }
}

/// Watches a set of directories for `*.jsonl` session logs, tracking each
/// file until it stabilizes. Polling is the source of truth; filesystem
/// notifications only shorten the latency, because appends do not produce
/// reliable modify events on every filesystem.
pub struct SessionWatcher {
    _watcher: Option<PollWatcher>,
    events: Arc<EventBuffer>,
    registry: Arc<Mutex<HashMap<PathBuf, FileState>>>,
    shutdown: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl SessionWatcher {
    pub fn start(watch_dirs: Vec<PathBuf>, settings: WatcherSettings) -> Result<Self> {
        let events = Arc::new(EventBuffer::new(settings.event_buffer));
        let registry: Arc<Mutex<HashMap<PathBuf, FileState>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let shutdown = Arc::new(AtomicBool::new(false));

        let (tx_fs, rx_fs) = channel::<()>();
        let notify_config =
            notify::Config::default().with_poll_interval(Duration::from_millis(500));
        let watcher = PollWatcher::new(
            move |res: std::result::Result<notify::Event, notify::Error>| {
                if res.is_ok() {
                    let _ = tx_fs.send(());
                }
            },
            notify_config,
        )
        .ok();

        let mut watcher = watcher;
        if let Some(w) = watcher.as_mut() {
            for dir in &watch_dirs {
                if dir.exists() {
                    if let Err(err) = w.watch(dir, RecursiveMode::Recursive) {
                        tracing::warn!(dir = %dir.display(), error = %err, "fs notifications unavailable, relying on polling");
                    }
                }
            }
        }

        // Startup scan seeds state before the loop; no ready events fire
        // until files pass the stability window.
        scan(&watch_dirs, &registry, &events, &settings);

        let thread_events = Arc::clone(&events);
        let thread_registry = Arc::clone(&registry);
        let thread_shutdown = Arc::clone(&shutdown);
        let thread_settings = settings.clone();
        let handle = std::thread::Builder::new()
            .name("session-watcher".to_string())
            .spawn(move || {
                while !thread_shutdown.load(Ordering::Relaxed) {
                    // Either a notification arrives or the poll tick fires.
                    match rx_fs.recv_timeout(thread_settings.poll_interval) {
                        Ok(()) | Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
                        Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                            std::thread::sleep(thread_settings.poll_interval);
                        }
                    }
                    if thread_shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                    scan(&watch_dirs, &thread_registry, &thread_events, &thread_settings);
                }
            })?;

        Ok(Self {
            _watcher: watcher,
            events,
            registry,
            shutdown,
            handle: Some(handle),
        })
    }

    /// Block up to `timeout` for the next event.
    pub fn next_event(&self, timeout: Duration) -> Option<WatchEvent> {
        self.events.pop(timeout)
    }

    pub fn status(&self) -> WatcherStatus {
        let registry = self.registry.lock().unwrap_or_else(|p| p.into_inner());
        WatcherStatus {
            tracked_files: registry.len(),
            overflow_count: self.events.overflow_count(),
        }
    }

    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SessionWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn scan(
    watch_dirs: &[PathBuf],
    registry: &Mutex<HashMap<PathBuf, FileState>>,
    events: &EventBuffer,
    settings: &WatcherSettings,
) {
    let mut seen: Vec<PathBuf> = Vec::new();

    for dir in watch_dirs {
        for entry in walkdir::WalkDir::new(dir)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let path = entry.path();
            if !entry.file_type().is_file() || !is_session_file(path) {
                continue;
            }

            match std::fs::metadata(path) {
                Ok(metadata) => {
                    seen.push(path.to_path_buf());
                    observe_file(path, &metadata, registry, events, settings);
                }
                Err(err) => {
                    events.push(WatchEvent::Error(format!(
                        "cannot stat {}: {}",
                        path.display(),
                        err
                    )));
                    let mut reg = registry.lock().unwrap_or_else(|p| p.into_inner());
                    reg.remove(path);
                }
            }
        }
    }

    // Forget files that disappeared; they re-register on reappearance.
    let mut reg = registry.lock().unwrap_or_else(|p| p.into_inner());
    reg.retain(|path, _| seen.contains(path));
}

fn is_session_file(path: &Path) -> bool {
    path.extension().map(|ext| ext == "jsonl").unwrap_or(false)
}

fn observe_file(
    path: &Path,
    metadata: &std::fs::Metadata,
    registry: &Mutex<HashMap<PathBuf, FileState>>,
    events: &EventBuffer,
    settings: &WatcherSettings,
) {
    let size = metadata.len();
    let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);

    let mut pending: Vec<WatchEvent> = Vec::new();
    {
        let mut reg = registry.lock().unwrap_or_else(|p| p.into_inner());
        let state = reg.entry(path.to_path_buf()).or_insert_with(|| FileState {
            first_seen_at: Utc::now(),
            last_modified_at: modified,
            last_size: size,
            last_entry_id: None,
            is_stable: false,
            notified: false,
            last_change: Instant::now(),
            idle_notified: false,
            error_emitted: false,
        });

        let changed = size != state.last_size || modified != state.last_modified_at;
        if changed {
            state.last_size = size;
            state.last_modified_at = modified;
            state.last_change = Instant::now();
            state.is_stable = false;
            state.notified = false;
            state.idle_notified = false;
            state.error_emitted = false;
            return;
        }

        let quiet_for = state.last_change.elapsed();

        if !state.is_stable && quiet_for >= settings.stability_window {
            state.is_stable = true;
        }

        if state.is_stable && !state.notified {
            match read_session_file(path) {
                Ok(parsed) => {
                    let leaf = parsed.leaf_entry_id().map(String::from);
                    if leaf.is_some() && leaf != state.last_entry_id {
                        state.last_entry_id = leaf;
                        pending.push(WatchEvent::SessionReady(path.to_path_buf()));
                    }
                    state.notified = true;
                }
                Err(err) => {
                    if !state.error_emitted {
                        pending.push(WatchEvent::Error(format!("{}", err)));
                        state.error_emitted = true;
                    }
                    state.notified = true;
                }
            }
        }

        if quiet_for >= settings.idle_window && !state.idle_notified {
            state.idle_notified = true;
            pending.push(WatchEvent::SessionIdle(path.to_path_buf()));
        }
    }

    for event in pending {
        events.push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn settings(stability_ms: u64, idle_ms: u64) -> WatcherSettings {
        WatcherSettings {
            poll_interval: Duration::from_millis(20),
            stability_window: Duration::from_millis(stability_ms),
            idle_window: Duration::from_millis(idle_ms),
            event_buffer: 32,
        }
    }

    fn write_session(path: &Path, entry_count: usize) {
        let mut file = std::fs::File::create(path).unwrap();
        writeln!(file, "{{\"version\":1,\"cwd\":\"/p\"}}").unwrap();
        for i in 1..=entry_count {
            let parent = if i == 1 {
                String::new()
            } else {
                format!("\"parentId\":\"e{}\",", i - 1)
            };
            writeln!(
                file,
                "{{\"id\":\"e{}\",{}\"timestamp\":\"2026-01-01T00:00:{:02}Z\",\"type\":\"user\",\"payload\":{{\"text\":\"x\"}}}}",
                i, parent, i
            )
            .unwrap();
        }
    }

    fn wait_for_ready(watcher: &SessionWatcher, within: Duration) -> Option<PathBuf> {
        let deadline = Instant::now() + within;
        while Instant::now() < deadline {
            match watcher.next_event(Duration::from_millis(50)) {
                Some(WatchEvent::SessionReady(path)) => return Some(path),
                Some(_) => continue,
                None => continue,
            }
        }
        None
    }

    #[test]
    fn test_ready_fires_once_per_leaf() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s1.jsonl");
        write_session(&path, 3);

        let mut watcher =
            SessionWatcher::start(vec![dir.path().to_path_buf()], settings(50, 60_000)).unwrap();

        let ready = wait_for_ready(&watcher, Duration::from_secs(5));
        assert_eq!(ready.as_deref(), Some(path.as_path()));

        // No second ready without a change.
        assert!(wait_for_ready(&watcher, Duration::from_millis(300)).is_none());

        watcher.stop();
    }

    #[test]
    fn test_ready_refires_after_append() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s1.jsonl");
        write_session(&path, 2);

        let mut watcher =
            SessionWatcher::start(vec![dir.path().to_path_buf()], settings(50, 60_000)).unwrap();
        assert!(wait_for_ready(&watcher, Duration::from_secs(5)).is_some());

        write_session(&path, 4);
        assert!(wait_for_ready(&watcher, Duration::from_secs(5)).is_some());

        watcher.stop();
    }

    #[test]
    fn test_idle_event() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s1.jsonl");
        write_session(&path, 1);

        let mut watcher =
            SessionWatcher::start(vec![dir.path().to_path_buf()], settings(10, 100)).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut saw_idle = false;
        while Instant::now() < deadline {
            if let Some(WatchEvent::SessionIdle(idle_path)) =
                watcher.next_event(Duration::from_millis(50))
            {
                assert_eq!(idle_path, path);
                saw_idle = true;
                break;
            }
        }
        assert!(saw_idle);

        watcher.stop();
    }

    #[test]
    fn test_malformed_header_emits_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.jsonl");
        std::fs::write(&path, "definitely not json\n").unwrap();

        let mut watcher =
            SessionWatcher::start(vec![dir.path().to_path_buf()], settings(10, 60_000)).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut saw_error = false;
        while Instant::now() < deadline {
            if let Some(WatchEvent::Error(message)) = watcher.next_event(Duration::from_millis(50))
            {
                assert!(message.contains("Invalid session header"));
                saw_error = true;
                break;
            }
        }
        assert!(saw_error);

        watcher.stop();
    }

    #[test]
    fn test_non_jsonl_ignored() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("notes.txt"), "hello").unwrap();

        let mut watcher =
            SessionWatcher::start(vec![dir.path().to_path_buf()], settings(10, 60_000)).unwrap();
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(watcher.status().tracked_files, 0);

        watcher.stop();
    }

    #[test]
    fn test_event_buffer_drops_oldest() {
        let buffer = EventBuffer::new(2);
        buffer.push(WatchEvent::Error("a".into()));
        buffer.push(WatchEvent::Error("b".into()));
        buffer.push(WatchEvent::Error("c".into()));

        assert_eq!(buffer.overflow_count(), 1);
        assert_eq!(
            buffer.pop(Duration::from_millis(10)),
            Some(WatchEvent::Error("b".into()))
        );
        assert_eq!(
            buffer.pop(Duration::from_millis(10)),
            Some(WatchEvent::Error("c".into()))
        );
        assert_eq!(buffer.pop(Duration::from_millis(10)), None);
    }
}
