//! The file-tailing input plugin.
//!
//! [`TailInput`] resolves a glob against the filesystem once a minute and
//! keeps exactly one [`Watcher`] per matched path. Each watcher feeds a
//! [`LineParser`] that turns raw lines into events and emits them through
//! the unit's environment.
//!
//! # Architecture
//!
//! ```text
//! filesystem ──notify──► fanout task ──► Watcher ──lines──► LineParser ──► Env::emit
//!                                          ▲
//!      path-watcher loop (minute tick, glob ∩ filesystem)
//! ```
//!
//! Position bookkeeping is shared: every tail unit naming the same
//! `pos_file` shares one [`position::PositionFile`] through the process's
//! [`position::PositionRegistry`], so offsets survive restarts and two units
//! never fight over one cursor file.

pub mod position;
pub mod watcher;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode, Watcher as _};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::message::{Event, Record};
use crate::parser::{self, Parser, RawParser, TimeParser};
use crate::plugin::{Env, Plugin, PluginError};
use position::{PositionError, PositionFile, PositionRegistry};
use watcher::{LineHandler, WatchRegistry, Watcher, WatcherConfig, DEFAULT_FS_EVENT_CAPACITY};

/// Default interval of the glob sweep.
pub const DEFAULT_PATH_SCAN_INTERVAL: Duration = Duration::from_secs(60);

/// Default record key the time is read from.
pub const DEFAULT_TIME_KEY: &str = "time";

/// Tail engine errors.
#[derive(Debug, Error)]
pub enum TailError {
    /// The configured glob pattern is invalid.
    #[error("invalid path pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    /// The filesystem watcher failed.
    #[error("filesystem watcher error: {0}")]
    Notify(#[from] notify::Error),

    /// Position bookkeeping failed.
    #[error(transparent)]
    Position(#[from] PositionError),
}

/// User configuration for one tail unit.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TailConfig {
    /// Event tag; a `*` expands to the dotted source path.
    pub tag: String,
    /// Glob selecting the files to tail.
    pub path: String,
    /// Path of the shared position file.
    pub pos_file: String,
    /// Line format (see [`crate::parser::get`]).
    pub format: String,
    /// Record key holding the event time. Defaults to `time`.
    pub time_key: String,
    /// Time format for the time parser.
    pub time_format: String,
    /// Fixed-offset timezone applied to naive times.
    pub timezone: String,
    /// Record key whose string value is re-parsed as the real record.
    pub record_key: String,
    /// Format of the re-parsed record.
    pub record_format: String,
    /// Whether first-seen files are read from the beginning.
    pub read_from_head: bool,
}

/// Intervals and capacities of the tail engine. Production defaults; tests
/// shrink them.
#[derive(Debug, Clone)]
pub struct TailTuning {
    /// Glob sweep interval.
    pub path_scan_interval: Duration,
    /// Per-watcher tuning.
    pub watcher: WatcherConfig,
}

impl Default for TailTuning {
    fn default() -> Self {
        Self {
            path_scan_interval: DEFAULT_PATH_SCAN_INTERVAL,
            watcher: WatcherConfig::default(),
        }
    }
}

/// Substitute `*` in `tag` with the path, slashes becoming dots.
pub fn real_tag(tag: &str, path: &str) -> String {
    if !tag.contains('*') {
        return tag.to_string();
    }
    let dotted = path.trim_matches('/').replace('/', ".");
    tag.replace('*', &dotted)
}

/// The shared filesystem watcher behind a registration mutex.
struct NotifyRegistry {
    watcher: StdMutex<RecommendedWatcher>,
}

impl WatchRegistry for NotifyRegistry {
    fn register(&self, path: &std::path::Path) -> notify::Result<()> {
        self.watcher
            .lock()
            .unwrap()
            .watch(path, RecursiveMode::NonRecursive)
    }

    fn deregister(&self, path: &std::path::Path) -> notify::Result<()> {
        self.watcher.lock().unwrap().unwatch(path)
    }
}

/// Parses one watcher's lines into events.
///
/// Parse failures fall back to the raw parser, a configured `record_key`
/// re-parses the nested payload, and a present `time_key` stamps the event
/// with the parsed time; anything else gets the current time.
struct LineParser {
    env: Env,
    tag: String,
    parser: Arc<dyn Parser>,
    time_parser: TimeParser,
    time_key: String,
    record_key: Option<String>,
    record_parser: Option<Arc<dyn Parser>>,
}

impl LineParser {
    fn parse_line(&self, raw: &[u8]) {
        let line = String::from_utf8_lossy(raw);
        let record = match self.parser.parse(&line) {
            Ok(record) => record,
            Err(e) => {
                self.env
                    .log
                    .warn(format_args!("Line parser failed: {e}, using raw parser: {line}"));
                RawParser.parse(&line).unwrap_or_default()
            }
        };
        self.env.emit(self.make_event(record));
    }

    fn make_event(&self, mut record: Record) -> Event {
        if let (Some(key), Some(record_parser)) = (&self.record_key, &self.record_parser) {
            match record.get(key).and_then(serde_json::Value::as_str) {
                Some(nested) => match record_parser.parse(nested) {
                    Ok(reparsed) => record = reparsed,
                    Err(e) => self.env.log.warn(format_args!("Record parser failed: {e}")),
                },
                None => self.env.log.warn("record key configured but not present"),
            }
        }

        if !self.time_key.is_empty() {
            if let Some(value) = record.get(&self.time_key) {
                match self.time_parser.parse(value) {
                    Ok(time) => return Event::with_time(self.tag.clone(), time.into(), record),
                    Err(e) => self.env.log.warn(format_args!("Time parser failed: {e}")),
                }
            } else {
                self.env.log.warn("time key configured but not present");
            }
        }
        Event::new(self.tag.clone(), record)
    }
}

/// The tail input plugin.
pub struct TailInput {
    registry: Arc<PositionRegistry>,
    tuning: TailTuning,
    cancel: CancellationToken,
    env: Option<Env>,
    conf: TailConfig,
    parser: Option<Arc<dyn Parser>>,
    time_parser: Option<TimeParser>,
    record_parser: Option<Arc<dyn Parser>>,
    positions: Option<Arc<PositionFile>>,
}

impl TailInput {
    /// Create a tail input against an explicit position registry.
    pub fn new(registry: Arc<PositionRegistry>) -> Self {
        Self::with_tuning(registry, TailTuning::default())
    }

    /// Create a tail input with explicit engine tuning.
    pub fn with_tuning(registry: Arc<PositionRegistry>, tuning: TailTuning) -> Self {
        Self {
            registry,
            tuning,
            cancel: CancellationToken::new(),
            env: None,
            conf: TailConfig::default(),
            parser: None,
            time_parser: None,
            record_parser: None,
            positions: None,
        }
    }

    /// The factory the plugin runtime calls per unit.
    pub fn factory() -> crate::plugin::PluginInstance {
        crate::plugin::PluginInstance::Input(Box::new(TailInput::default()))
    }
}

impl Default for TailInput {
    fn default() -> Self {
        Self::new(PositionRegistry::global())
    }
}

impl Plugin for TailInput {
    fn init(&mut self, env: Env) -> Result<(), PluginError> {
        let mut conf: TailConfig = env.read_config()?;
        if conf.time_key.is_empty() {
            conf.time_key = DEFAULT_TIME_KEY.to_string();
        }

        let (line_parser, time_parser) =
            parser::get(&conf.format, &conf.time_format, &conf.timezone)?;
        if !conf.record_key.is_empty() {
            let (record_parser, _) = parser::get(&conf.record_format, "", "")?;
            self.record_parser = Some(record_parser);
        }

        self.positions = Some(self.registry.open(&conf.pos_file)?);
        self.parser = Some(line_parser);
        self.time_parser = Some(time_parser);
        self.conf = conf;
        self.env = Some(env);
        Ok(())
    }

    fn start(&mut self) -> Result<(), PluginError> {
        let env = self
            .env
            .clone()
            .ok_or_else(|| PluginError::other("tail input started before init"))?;
        let positions = self
            .positions
            .clone()
            .ok_or_else(|| PluginError::other("tail input started before init"))?;

        let (fs_tx, fs_rx) = mpsc::channel(DEFAULT_FS_EVENT_CAPACITY);
        let fs_watcher = RecommendedWatcher::new(
            move |result: notify::Result<notify::Event>| match result {
                Ok(event) => {
                    // The fanout task applies backpressure; notify's own
                    // thread must not be blocked for long.
                    let _ = fs_tx.blocking_send(event);
                }
                Err(e) => tracing::warn!(error = %e, "filesystem watcher error"),
            },
            notify::Config::default(),
        )
        .map_err(TailError::from)?;
        let fs_registry = Arc::new(NotifyRegistry {
            watcher: StdMutex::new(fs_watcher),
        });

        let watchers: Arc<Mutex<HashMap<PathBuf, Watcher>>> = Arc::default();

        tokio::spawn(fs_event_loop(
            Arc::clone(&watchers),
            fs_rx,
            self.cancel.clone(),
        ));

        let sweeper = PathSweeper {
            env,
            conf: self.conf.clone(),
            parser: self.parser.clone().expect("parser set by init"),
            time_parser: self.time_parser.clone().expect("time parser set by init"),
            record_parser: self.record_parser.clone(),
            positions,
            watchers,
            fs_registry,
            tuning: self.tuning.clone(),
        };
        tokio::spawn(sweeper.run(self.cancel.clone()));
        Ok(())
    }

    fn close(&mut self) -> Result<(), PluginError> {
        self.cancel.cancel();
        Ok(())
    }
}

/// Routes filesystem events to the watcher owning the affected path.
async fn fs_event_loop(
    watchers: Arc<Mutex<HashMap<PathBuf, Watcher>>>,
    mut fs_rx: mpsc::Receiver<notify::Event>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return,
            maybe = fs_rx.recv() => match maybe {
                Some(event) => event,
                None => return,
            },
        };
        let watchers = watchers.lock().await;
        for path in &event.paths {
            match watchers.get(path) {
                Some(watcher) => watcher.notify_fs_event(event.clone()),
                None => {
                    tracing::warn!(
                        path = %path.display(),
                        "filesystem event for a closed watcher"
                    );
                }
            }
        }
    }
}

/// The minute-tick glob loop.
struct PathSweeper {
    env: Env,
    conf: TailConfig,
    parser: Arc<dyn Parser>,
    time_parser: TimeParser,
    record_parser: Option<Arc<dyn Parser>>,
    positions: Arc<PositionFile>,
    watchers: Arc<Mutex<HashMap<PathBuf, Watcher>>>,
    fs_registry: Arc<NotifyRegistry>,
    tuning: TailTuning,
}

impl PathSweeper {
    async fn run(self, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(self.tuning.path_scan_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.close_all().await;
                    return;
                }
                _ = tick.tick() => {}
            }
            if let Err(e) = self.sweep().await {
                // A broken pattern never fixes itself; end the loop.
                self.env.log.error(format_args!("path sweep failed: {e}"));
                return;
            }
        }
    }

    async fn close_all(&self) {
        let mut watchers = self.watchers.lock().await;
        for (_, watcher) in watchers.drain() {
            watcher.close();
        }
    }

    /// Reconcile the watcher set with the current glob expansion.
    async fn sweep(&self) -> Result<(), TailError> {
        let matched: HashSet<PathBuf> = glob::glob(&self.conf.path)?
            .filter_map(|entry| match entry {
                Ok(path) => Some(path),
                Err(e) => {
                    self.env.log.warn(format_args!("glob entry skipped: {e}"));
                    None
                }
            })
            .collect();

        let mut watchers = self.watchers.lock().await;
        let current: HashSet<PathBuf> = watchers.keys().cloned().collect();

        for path in matched.difference(&current) {
            self.env
                .log
                .info(format_args!("Start watching file: {}", path.display()));
            let entry = self.positions.get(path);
            entry.set_read_from_head(self.conf.read_from_head);

            let line_parser = Arc::new(LineParser {
                env: self.env.clone(),
                tag: real_tag(&self.conf.tag, &path.to_string_lossy()),
                parser: Arc::clone(&self.parser),
                time_parser: self.time_parser.clone(),
                time_key: self.conf.time_key.clone(),
                record_key: (!self.conf.record_key.is_empty())
                    .then(|| self.conf.record_key.clone()),
                record_parser: self.record_parser.clone(),
            });
            let handler: LineHandler = Arc::new(move |raw| line_parser.parse_line(raw));

            let watcher = Watcher::spawn(
                entry,
                handler,
                Arc::clone(&self.fs_registry) as Arc<dyn WatchRegistry>,
                self.tuning.watcher.clone(),
            )
            .await;
            watchers.insert(path.clone(), watcher);
        }

        let gone: Vec<PathBuf> = current.difference(&matched).cloned().collect();
        for path in gone {
            self.env
                .log
                .info(format_args!("Stop watching file: {}", path.display()));
            if let Err(e) = self.fs_registry.deregister(&path) {
                self.env
                    .log
                    .debug(format_args!("deregister failed for {}: {e}", path.display()));
            }
            if let Some(watcher) = watchers.remove(&path) {
                watcher.close();
            }
        }
        Ok(())
    }
}
