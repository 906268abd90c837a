//! Core message and event types shared by the runtime and the pipe.
//!
//! A [`Message`] is the unit of pipe traffic between the parent router and a
//! plugin process. Every message carries a `unit_id` (0 addresses the runtime
//! itself) and a [`Body`] variant whose wire discriminant is stable forever
//! once assigned.
//!
//! An [`Event`] is one log record: a dot-delimited tag, a timestamp with
//! nanosecond precision, and a string-keyed record of heterogeneous values.
//! Events are immutable after creation; filters either construct a new event
//! or hand the original back.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// The record payload of an event: string keys mapped to JSON-shaped values
/// (strings, integers, floats, booleans, nested maps).
pub type Record = serde_json::Map<String, serde_json::Value>;

/// Protocol version exchanged on `InfoRequest`. Only version 1 is defined.
pub const PROTOCOL_VERSION: u32 = 1;

/// Plugin metadata returned in response to an `InfoRequest`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginInfo {
    /// Protocol version the plugin speaks.
    pub proto_ver: u32,
}

impl Default for PluginInfo {
    fn default() -> Self {
        Self {
            proto_ver: PROTOCOL_VERSION,
        }
    }
}

/// Event timestamp: seconds since the Unix epoch plus a nanosecond part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventTime {
    /// Whole seconds since the epoch.
    pub secs: i64,
    /// Nanoseconds within the second.
    pub nanos: u32,
}

impl EventTime {
    /// Capture the current wall-clock time.
    pub fn now() -> Self {
        Utc::now().into()
    }

    /// Convert back to a UTC datetime. Returns `None` for out-of-range values.
    pub fn to_datetime(self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.secs, self.nanos).single()
    }
}

impl From<DateTime<Utc>> for EventTime {
    fn from(t: DateTime<Utc>) -> Self {
        Self {
            secs: t.timestamp(),
            nanos: t.timestamp_subsec_nanos(),
        }
    }
}

/// A timestamped, tagged log record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Dot-delimited routing tag, e.g. `app.access`.
    pub tag: String,
    /// Record timestamp.
    pub time: EventTime,
    /// The record fields.
    pub record: Record,
}

impl Event {
    /// Create an event stamped with the current time.
    pub fn new(tag: impl Into<String>, record: Record) -> Self {
        Self::with_time(tag, EventTime::now(), record)
    }

    /// Create an event with an explicit timestamp.
    pub fn with_time(tag: impl Into<String>, time: EventTime, record: Record) -> Self {
        Self {
            tag: tag.into(),
            time,
            record,
        }
    }
}

/// Tuning options for the memory buffer attached to an output unit.
///
/// Delivered by the parent in a `BufferOption` message before the unit is
/// started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferOptions {
    /// Seconds between periodic flushes of the pending chunk.
    pub flush_interval_secs: u64,
    /// Number of items that triggers an immediate flush.
    pub chunk_limit: usize,
    /// Upper bound on buffered bytes; pushes beyond this fail.
    pub max_pending_bytes: usize,
}

impl Default for BufferOptions {
    fn default() -> Self {
        Self {
            flush_interval_secs: 60,
            chunk_limit: 1000,
            max_pending_bytes: 8 * 1024 * 1024,
        }
    }
}

/// Message body, tagged on the wire by a stable integer discriminant.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    /// Parent asks for plugin metadata.
    InfoRequest,
    /// Plugin replies with its metadata.
    InfoResponse(PluginInfo),
    /// Configuration blob for one unit (keyed-record text, decoded by the
    /// unit through `Env::read_config`).
    Configure(String),
    /// Buffer tuning for an output unit.
    BufferOption(BufferOptions),
    /// Start the unit.
    Start,
    /// An event routed to a unit, or emitted by an input unit.
    Event(Event),
    /// A filtered event flowing back to the parent for re-routing.
    EventChain(Event),
    /// Stop the unit (or, at unit id 0, the whole runtime).
    Stop,
    /// Runtime acknowledgement that every unit has shut down.
    Terminated,
    /// Captured standard-output bytes from the plugin process.
    Stdout(Vec<u8>),
}

impl Body {
    /// The wire discriminant. Values are immutable across protocol versions.
    pub fn kind(&self) -> u8 {
        match self {
            Body::InfoRequest => 0,
            Body::InfoResponse(_) => 1,
            Body::Configure(_) => 2,
            Body::BufferOption(_) => 3,
            Body::Start => 4,
            Body::Event(_) => 5,
            Body::EventChain(_) => 6,
            Body::Stop => 7,
            Body::Terminated => 8,
            Body::Stdout(_) => 9,
        }
    }
}

/// One unit of pipe traffic.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Addressed unit; 0 means the runtime itself.
    pub unit_id: i32,
    /// The typed payload.
    pub body: Body,
}

impl Message {
    /// A runtime-wide message (unit id 0).
    pub fn control(body: Body) -> Self {
        Self { unit_id: 0, body }
    }

    /// A message addressed to a specific unit.
    pub fn unit(unit_id: i32, body: Body) -> Self {
        Self { unit_id, body }
    }
}
