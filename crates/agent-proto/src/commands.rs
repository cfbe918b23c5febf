//! Command registry: one variant per wire command.
//!
//! The enum is internally tagged on `cmd`, so the variant payload structs
//! serialize their fields directly into the frame next to the envelope.

use crate::DoneStatus;
use crate::objects::{
    EventObject, EventsConfig, MediaType, StreamReason, SyncStatus, TimelineSlice, UploadCategory,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd")]
#[serde(rename_all = "snake_case")]
pub enum CommandBody {
    // agent -> cloud
    Register(Register),
    CamRegister(CamRegister),
    Done(Done),
    CamEvent(CamEvent),
    GetDirectUploadUrl(GetDirectUploadUrl),
    CamStatus(CamStatus),
    SupportedStreams(SupportedStreams),
    CamEventsConf(CamEventsConf),
    CamMemorycardSynchronizeStatus(CamMemorycardSynchronizeStatus),
    CamMemorycardTimeline(CamMemorycardTimeline),

    // cloud -> agent
    Hello(Hello),
    CamHello(CamHello),
    Configure(Configure),
    Bye(Bye),
    ReportProblem(ReportProblem),
    StreamStart(StreamStart),
    StreamStop(StreamStop),
    GetCamStatus,
    GetSupportedStreams,
    GetCamEvents,
    SetCamEvents(SetCamEvents),
    CamTriggerEvent(CamTriggerEvent),
    DirectUploadUrl(DirectUploadUrl),
    CamMemorycardSynchronize(CamMemorycardSynchronize),
    CamMemorycardSynchronizeCancel(CamMemorycardSynchronizeCancel),
    GetCamMemorycardTimeline(GetCamMemorycardTimeline),
    CamMemorycardRecording(CamMemorycardRecording),
}

impl CommandBody {
    /// Wire name of the command, as it appears in the `cmd` field.
    pub fn name(&self) -> &'static str {
        match self {
            CommandBody::Register(_) => "register",
            CommandBody::CamRegister(_) => "cam_register",
            CommandBody::Done(_) => "done",
            CommandBody::CamEvent(_) => "cam_event",
            CommandBody::GetDirectUploadUrl(_) => "get_direct_upload_url",
            CommandBody::CamStatus(_) => "cam_status",
            CommandBody::SupportedStreams(_) => "supported_streams",
            CommandBody::CamEventsConf(_) => "cam_events_conf",
            CommandBody::CamMemorycardSynchronizeStatus(_) => "cam_memorycard_synchronize_status",
            CommandBody::CamMemorycardTimeline(_) => "cam_memorycard_timeline",
            CommandBody::Hello(_) => "hello",
            CommandBody::CamHello(_) => "cam_hello",
            CommandBody::Configure(_) => "configure",
            CommandBody::Bye(_) => "bye",
            CommandBody::ReportProblem(_) => "report_problem",
            CommandBody::StreamStart(_) => "stream_start",
            CommandBody::StreamStop(_) => "stream_stop",
            CommandBody::GetCamStatus => "get_cam_status",
            CommandBody::GetSupportedStreams => "get_supported_streams",
            CommandBody::GetCamEvents => "get_cam_events",
            CommandBody::SetCamEvents(_) => "set_cam_events",
            CommandBody::CamTriggerEvent(_) => "cam_trigger_event",
            CommandBody::DirectUploadUrl(_) => "direct_upload_url",
            CommandBody::CamMemorycardSynchronize(_) => "cam_memorycard_synchronize",
            CommandBody::CamMemorycardSynchronizeCancel(_) => "cam_memorycard_synchronize_cancel",
            CommandBody::GetCamMemorycardTimeline(_) => "get_cam_memorycard_timeline",
            CommandBody::CamMemorycardRecording(_) => "cam_memorycard_recording",
        }
    }
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

/// First command after the socket opens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Register {
    pub ver: String,
    pub tz: String,
    pub vendor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pwd: Option<String>,
    /// Session id from a previous connection, lets the server resume state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_sid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reg_token: Option<String>,
    #[serde(default)]
    pub media_protocols: Vec<String>,
}

/// Server reply to `register`; carries per-session endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
    /// Legacy field, superseded by `upload_uri` when both are present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_server: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connid: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CamRegister {
    pub ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    pub brand: String,
    pub model: String,
    pub sn: String,
    pub version: String,
    #[serde(rename = "type")]
    pub device_type: String,
}

/// Final handshake step; after this the session is READY.
/// The camera id travels in the envelope `cam_id` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CamHello {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default)]
    pub activity: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Configure {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tz: Option<String>,
    /// Alternate server address, used when the cloud asks for RECONNECT.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ByeReason {
    Reconnect,
    ConnClose,
    AuthFailure,
    Timeout,
    System,
    #[serde(other)]
    Invalid,
}

/// Session teardown, either direction.  `retry` is the reconnect delay in ms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bye {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<ByeReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportProblem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Universal acknowledgment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Done {
    pub orig_cmd: String,
    pub status: DoneStatus,
}

// ---------------------------------------------------------------------------
// Streaming
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamStart {
    pub stream_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publish_session_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<StreamReason>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamStop {
    pub stream_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<StreamReason>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CamStatus {
    pub ip: String,
    pub activity: bool,
    pub streaming: bool,
    pub status_led: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupportedStreamConfig {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupportedStreams {
    pub streams: Vec<SupportedStreamConfig>,
    #[serde(default)]
    pub video_es: Vec<String>,
    #[serde(default)]
    pub audio_es: Vec<String>,
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CamEventsConf {
    #[serde(flatten)]
    pub config: EventsConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetCamEvents {
    #[serde(flatten)]
    pub config: EventsConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CamEvent {
    #[serde(flatten)]
    pub event: EventObject,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CamTriggerEvent {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Direct upload
// ---------------------------------------------------------------------------

/// Ask the cloud for a one-shot upload URL for a time slice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetDirectUploadUrl {
    pub category: UploadCategory,
    #[serde(rename = "type")]
    pub media_type: MediaType,
    /// Packed ISO begin time of the slice.
    pub file_time: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_us: Option<u64>,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memorycard_sync_ticket: Option<String>,
}

/// One issued URL; `extra` entries cover multi-payload events, keyed by
/// category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectUploadUrl {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<UploadCategory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra: Vec<DirectUploadUrlEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectUploadUrlEntry {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<UploadCategory>,
}

// ---------------------------------------------------------------------------
// Memorycard timeline & synchronization
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetCamMemorycardTimeline {
    pub request_id: String,
    pub start: String,
    pub end: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CamMemorycardTimeline {
    pub request_id: String,
    pub start: String,
    pub end: String,
    pub data: Vec<TimelineSlice>,
}

/// Sync request for `[start,end]`; may piggyback cancellations of earlier
/// requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CamMemorycardSynchronize {
    pub request_id: String,
    pub start: String,
    pub end: String,
    #[serde(default)]
    pub cancel_requests: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CamMemorycardSynchronizeStatus {
    pub request_id: String,
    pub status: SyncStatus,
    pub progress: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CamMemorycardSynchronizeCancel {
    pub request_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CamMemorycardRecording {
    pub stream_id: String,
    pub enabled: bool,
}
