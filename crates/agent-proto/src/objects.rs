//! Shared protocol objects: event configuration, event reports, upload and
//! stream enums.
//!
//! Caps are declared once by the event producer and are immutable afterwards;
//! `set_cam_events` may only toggle the flags (`active`, `stream`,
//! `snapshot`, `period`) within those caps.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Motion,
    Sound,
    Net,
    Record,
    Memorycard,
    Wifi,
    Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadCategory {
    Record,
    Snapshot,
    FileMeta,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Mp4,
    Jpg,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamReason {
    Live,
    Record,
    RecordByEvent,
    ServerByEvent,
}

/// Terminal and intermediate states of one sync request, as reported in
/// `cam_memorycard_synchronize_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Pending,
    Done,
    Error,
    Canceled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemorycardStatus {
    Normal,
    Missing,
    NeedFormat,
}

// ---------------------------------------------------------------------------
// Event configuration
// ---------------------------------------------------------------------------

/// Capabilities of one event as declared by its producer.  Never mutated by
/// the cloud.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventCaps {
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub snapshot: bool,
    #[serde(default)]
    pub periodic: bool,
    #[serde(default)]
    pub trigger: bool,
    #[serde(default)]
    pub stateful: bool,
    #[serde(default)]
    pub state_emulation: bool,
    /// Internal events are never reported to the cloud in `cam_events_conf`.
    #[serde(default)]
    pub internal_hidden: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventConfig {
    pub event: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_event_name: Option<String>,
    #[serde(default)]
    pub caps: EventCaps,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub snapshot: bool,
    /// Period in seconds for `caps.periodic` events; 0 means disabled.
    #[serde(default)]
    pub period: u64,
}

impl EventConfig {
    pub fn custom(name: &str) -> Self {
        EventConfig {
            event: EventKind::Custom,
            custom_event_name: Some(name.to_owned()),
            caps: EventCaps::default(),
            active: false,
            stream: false,
            snapshot: false,
            period: 0,
        }
    }

    /// Canonical event name: the custom name for custom events, the kind
    /// name otherwise.
    pub fn name(&self) -> String {
        match (self.event, &self.custom_event_name) {
            (EventKind::Custom, Some(n)) => n.clone(),
            (kind, _) => kind_name(kind).to_owned(),
        }
    }

    pub fn name_eq(&self, other: &EventConfig) -> bool {
        self.event == other.event && self.custom_event_name == other.custom_event_name
    }

    pub fn caps_eq(&self, other: &EventConfig) -> bool {
        self.caps == other.caps
    }
}

pub fn kind_name(kind: EventKind) -> &'static str {
    match kind {
        EventKind::Motion => "motion",
        EventKind::Sound => "sound",
        EventKind::Net => "net",
        EventKind::Record => "record",
        EventKind::Memorycard => "memorycard",
        EventKind::Wifi => "wifi",
        EventKind::Custom => "custom",
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub events: Vec<EventConfig>,
}

impl EventsConfig {
    pub fn find(&self, event: &EventObject) -> Option<&EventConfig> {
        self.events
            .iter()
            .find(|c| c.event == event.event && c.custom_event_name == event.custom_event_name)
    }

    pub fn find_by_name(&self, name: &str) -> Option<&EventConfig> {
        self.events.iter().find(|c| c.name() == name)
    }
}

// ---------------------------------------------------------------------------
// Event reports
// ---------------------------------------------------------------------------

/// Snapshot rides the event as a payload; the bytes never enter the JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    #[serde(default)]
    pub image_time: String,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
    #[serde(default)]
    pub size: u64,
    #[serde(skip)]
    pub image_data: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileMetaInfo {
    #[serde(default)]
    pub size: u64,
    #[serde(skip)]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemorycardInfo {
    pub status: MemorycardStatus,
    #[serde(default)]
    pub recording_status: bool,
}

impl Default for MemorycardStatus {
    fn default() -> Self {
        MemorycardStatus::Missing
    }
}

/// One event report.  `time` is epoch seconds with fractional microseconds,
/// matching the wire contract.  For stateful events `active` distinguishes
/// start (`true`) from stop (`false`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventObject {
    pub event: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_event_name: Option<String>,
    pub time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<EventStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_info: Option<SnapshotInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_meta_info: Option<FileMetaInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memorycard_info: Option<MemorycardInfo>,
    /// True for the synthetic continuation dummies emitted while a stateful
    /// event is active.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub state_emulation: bool,
}

impl EventObject {
    pub fn new(event: EventKind, custom_event_name: Option<String>, time: f64) -> Self {
        EventObject {
            event,
            custom_event_name,
            time,
            active: None,
            meta: None,
            status: None,
            snapshot_info: None,
            file_meta_info: None,
            memorycard_info: None,
            state_emulation: false,
        }
    }

    pub fn name(&self) -> String {
        match (self.event, &self.custom_event_name) {
            (EventKind::Custom, Some(n)) => n.clone(),
            (kind, _) => kind_name(kind).to_owned(),
        }
    }
}

// ---------------------------------------------------------------------------
// Timeline slices
// ---------------------------------------------------------------------------

/// One merged interval of the local recording timeline, packed-ISO endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineSlice {
    pub start: String,
    pub end: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_event_name_resolution() {
        let conf = EventConfig::custom("qos-report");
        assert_eq!(conf.name(), "qos-report");

        let motion = EventConfig {
            event: EventKind::Motion,
            ..EventConfig::custom("ignored")
        };
        assert_eq!(motion.name(), "motion");
    }

    #[test]
    fn events_config_lookup_distinguishes_custom_names() {
        let config = EventsConfig {
            enabled: true,
            events: vec![EventConfig::custom("a"), EventConfig::custom("b")],
        };

        let mut event = EventObject::new(EventKind::Custom, Some("b".to_owned()), 0.0);
        assert_eq!(config.find(&event).unwrap().name(), "b");

        event.custom_event_name = Some("c".to_owned());
        assert!(config.find(&event).is_none());
    }
}
