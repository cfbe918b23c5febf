//! External collaborator interfaces: media streams and event producers.
//!
//! The agent never decodes or transcodes media; a concrete stream only has
//! to publish, record, snapshot, and export recorded ranges.  The record
//! side of a stream doubles as the synchronizer's source timeline through
//! [`RecordSource`].

use agent_proto::{EventConfig, EventObject};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use timeline_core::{Item, Period, Time, TimelineSource};
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub struct Snapshot {
    pub time: Time,
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordClip {
    pub period: Period,
}

/// One media stream of the device (e.g. the main RTSP profile).
#[async_trait]
pub trait MediaStream: Send + Sync + 'static {
    /// Cloud-visible stream id.
    fn name(&self) -> &str;

    async fn start_live(&self, publish_url: &str) -> bool;
    async fn stop_live(&self);

    /// Local recording; `by_event` restricts recording to trigger windows.
    async fn start_recording(&self, by_event: bool) -> bool;
    async fn stop_recording(&self);

    async fn get_snapshot(&self) -> Option<Snapshot>;

    /// Recorded clips intersecting `[begin, end)`, sorted by begin.
    async fn record_get_list(&self, begin: Time, end: Time) -> Vec<RecordClip>;

    /// Export one recorded range as a single container.
    async fn record_export(&self, begin: Time, end: Time) -> Option<Vec<u8>>;
}

/// A producer of device events (motion detector, sound detector, ...).
///
/// Producers declare their events once via `events()`; caps declared there
/// are frozen for the lifetime of the stream.
pub trait EventProducer: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn events(&self) -> Vec<EventConfig>;

    /// Start delivering events into `notify`.  Stateful events must report
    /// their current state immediately after start.
    fn start(&self, notify: mpsc::UnboundedSender<EventObject>);

    fn stop(&self);

    /// Updated flag set for this producer's events; caps are unchanged.
    fn set_events(&self, configs: &[EventConfig]);

    /// Cloud-triggered event; `true` when accepted.
    fn trigger(&self, event: EventObject) -> bool;

    /// Toggle event-triggered local recording with the given padding.
    fn set_trigger_recording(&self, enabled: bool, pre: Duration, post: Duration);
}

// ---------------------------------------------------------------------------
// Record timeline adapter
// ---------------------------------------------------------------------------

/// Exposes a media stream's recordings as the synchronizer's source.
#[derive(Clone)]
pub struct RecordSource {
    stream: Arc<dyn MediaStream>,
}

impl RecordSource {
    pub fn new(stream: Arc<dyn MediaStream>) -> Self {
        RecordSource { stream }
    }
}

impl TimelineSource for RecordSource {
    async fn list(&self, begin: Time, end: Time) -> Vec<Item> {
        self.stream
            .record_get_list(begin, end)
            .await
            .into_iter()
            .map(|clip| Item::new(clip.period))
            .collect()
    }

    async fn load(&self, item: &mut Item) -> bool {
        match self
            .stream
            .record_export(item.period.begin, item.period.end)
            .await
        {
            Some(data) if !data.is_empty() => {
                item.data = data;
                item.state = timeline_core::DataState::Loaded;
                true
            }
            _ => false,
        }
    }
}

/// Source used when the agent runs without any media stream attached.
#[derive(Clone, Default)]
pub struct NullSource;

impl TimelineSource for NullSource {
    async fn list(&self, _begin: Time, _end: Time) -> Vec<Item> {
        Vec::new()
    }

    async fn load(&self, _item: &mut Item) -> bool {
        false
    }
}
