//! Per-file tailer.
//!
//! A [`Watcher`] follows one physical path and converts filesystem activity
//! into an ordered stream of lines, surviving rotation and truncation
//! without dropping or duplicating lines.
//!
//! Wakeup sources, raced in a single dispatch loop:
//!
//! - filesystem events, delivered through a bounded channel; a full channel
//!   silently drops because the tick below guarantees liveness
//! - an internal kick fired whenever the reader is (re)opened
//! - a periodic tick, which also doubles as the retry path when the file
//!   does not exist yet
//!
//! Scans serialize through one mutex, and rotation transitions happen under
//! that same mutex, so reads never interleave across the old and the new
//! file. On rotation the old reader is given a drain window before the
//! reopen; truncation reopens immediately.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use notify::EventKind;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use super::position::{PositionEntry, PositionError, PositionReader};

/// Default interval of the liveness tick.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(10);

/// Default drain window granted to a live reader before a rotation reopen.
pub const DEFAULT_ROTATION_DRAIN_DELAY: Duration = Duration::from_secs(5);

/// Default capacity of the filesystem-event channel.
pub const DEFAULT_FS_EVENT_CAPACITY: usize = 100;

/// Watcher tuning. The defaults are the production values; tests shrink the
/// durations to keep wall-clock time down.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Liveness tick interval.
    pub tick_interval: Duration,
    /// How long a live reader may drain the old file before a rotation
    /// reopen.
    pub rotation_drain_delay: Duration,
    /// Filesystem-event channel capacity.
    pub fs_event_capacity: usize,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            tick_interval: DEFAULT_TICK_INTERVAL,
            rotation_drain_delay: DEFAULT_ROTATION_DRAIN_DELAY,
            fs_event_capacity: DEFAULT_FS_EVENT_CAPACITY,
        }
    }
}

/// Receives each complete line the watcher reads, in file order.
pub type LineHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Registration surface of the shared filesystem watcher.
///
/// The watcher re-registers its path after every reopen (the old inode's
/// registration dies with the old file), and the tail input deregisters
/// paths that fall out of the glob.
pub trait WatchRegistry: Send + Sync {
    /// Start delivering events for `path`.
    fn register(&self, path: &Path) -> notify::Result<()>;
    /// Stop delivering events for `path`.
    fn deregister(&self, path: &Path) -> notify::Result<()>;
}

/// Tails one file.
pub struct Watcher {
    shared: Arc<WatcherShared>,
    fs_tx: mpsc::Sender<notify::Event>,
    cancel: CancellationToken,
}

impl Watcher {
    /// Create the watcher, open the file (when present), and start the
    /// dispatch loop.
    pub async fn spawn(
        entry: Arc<PositionEntry>,
        handler: LineHandler,
        registry: Arc<dyn WatchRegistry>,
        config: WatcherConfig,
    ) -> Watcher {
        let (fs_tx, fs_rx) = mpsc::channel(config.fs_event_capacity);
        let (notify_tx, notify_rx) = mpsc::channel(1);
        let shared = Arc::new(WatcherShared {
            entry,
            handler,
            registry,
            config,
            notify_tx,
            scan_state: Mutex::new(ScanState::default()),
        });
        shared.open().await;

        let cancel = CancellationToken::new();
        tokio::spawn(dispatch_loop(
            Arc::clone(&shared),
            fs_rx,
            notify_rx,
            cancel.clone(),
        ));

        Watcher {
            shared,
            fs_tx,
            cancel,
        }
    }

    /// The position entry this watcher advances.
    pub fn entry(&self) -> &Arc<PositionEntry> {
        &self.shared.entry
    }

    /// Hand a filesystem event to the dispatch loop.
    ///
    /// Non-blocking: a full channel drops the event, which is safe because
    /// the periodic tick will pick the change up.
    pub fn notify_fs_event(&self, event: notify::Event) {
        let _ = self.fs_tx.try_send(event);
    }

    /// Stop the dispatch loop. In-flight scans complete under the mutex.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

#[derive(Default)]
struct ScanState {
    reader: Option<PositionReader>,
    rotating: bool,
}

struct WatcherShared {
    entry: Arc<PositionEntry>,
    handler: LineHandler,
    registry: Arc<dyn WatchRegistry>,
    config: WatcherConfig,
    notify_tx: mpsc::Sender<()>,
    scan_state: Mutex<ScanState>,
}

impl WatcherShared {
    /// Read everything available, detecting rotation and truncation first.
    ///
    /// Runs at most once at a time; the mutex also blocks a pending reopen
    /// until the current pass is done, so no read ever straddles the swap
    /// from the old inode to the new one.
    async fn scan(self: &Arc<Self>) -> Result<(), PositionError> {
        let mut state = self.scan_state.lock().await;

        if !state.rotating {
            let (rotated, truncated) = self.entry.is_rotated();
            if rotated {
                tracing::info!(path = %self.entry.path().display(), "Rotation detected");
                let delay = if state.reader.is_some() {
                    self.config.rotation_drain_delay
                } else {
                    Duration::ZERO
                };
                state.rotating = true;
                let shared = Arc::clone(self);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    shared.open().await;
                });
            } else if truncated {
                tracing::info!(path = %self.entry.path().display(), "Truncation detected");
                state.rotating = true;
                let shared = Arc::clone(self);
                tokio::spawn(async move {
                    shared.open().await;
                });
                return Ok(());
            }
        }

        let Some(reader) = state.reader.as_mut() else {
            return Ok(());
        };
        loop {
            match reader.read_line()? {
                Some(line) => (self.handler)(&line),
                None => return Ok(()),
            }
        }
    }

    /// Close any current reader and open the file fresh.
    ///
    /// On success the path is (re)registered with the filesystem watcher and
    /// the dispatcher is kicked so the next scan runs immediately. On
    /// failure the reader stays absent and the periodic tick retries.
    async fn open(self: &Arc<Self>) {
        let mut state = self.scan_state.lock().await;
        state.rotating = false;
        state.reader = None;

        match PositionReader::open(Arc::clone(&self.entry)) {
            Ok(reader) => {
                state.reader = Some(reader);
                if let Err(e) = self.registry.register(self.entry.path()) {
                    tracing::warn!(
                        path = %self.entry.path().display(),
                        error = %e,
                        "failed to register path with filesystem watcher"
                    );
                }
            }
            Err(e) => {
                tracing::warn!(
                    path = %self.entry.path().display(),
                    error = %e,
                    "cannot open file, waiting for creation"
                );
            }
        }
        let _ = self.notify_tx.try_send(());
    }
}

async fn dispatch_loop(
    shared: Arc<WatcherShared>,
    mut fs_rx: mpsc::Receiver<notify::Event>,
    mut notify_rx: mpsc::Receiver<()>,
    cancel: CancellationToken,
) {
    let mut tick = tokio::time::interval(shared.config.tick_interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            maybe = notify_rx.recv() => {
                if maybe.is_none() {
                    return;
                }
            }
            maybe = fs_rx.recv() => {
                match maybe {
                    None => return,
                    // Only creation and writes wake the scanner; deletions
                    // surface indirectly through rotation on the next tick.
                    Some(event) => {
                        if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                            continue;
                        }
                    }
                }
            }
            _ = tick.tick() => {}
        }

        if let Err(e) = shared.scan().await {
            tracing::warn!(
                path = %shared.entry.path().display(),
                error = %e,
                "scan failed"
            );
        }
    }
}
