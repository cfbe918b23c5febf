//! Top-level agent manager.
//!
//! Wires the session, event engine, synchronizer and uploader together:
//! translates cloud requests (`stream_start`, `stream_stop`, memorycard
//! synchronization) into component calls, and reacts to normalized events by
//! starting, continuing, or finalizing records delivery.

use crate::events::{EngineConfig, EventEngine, EventSink};
use crate::media::{EventProducer, MediaStream, RecordSource};
use crate::session::{CommandHandler, HandlerResult, SessionHandle};
use crate::stats::Stats;
use crate::upload::{EventPayload, Uploader};
use agent_proto::time::{self, Time};
use agent_proto::{
    ByeReason, CamEvent, CamMemorycardSynchronizeStatus, CamStatus, CamEventsConf, Command,
    CommandBody, DoneStatus, EventConfig, EventKind, EventObject, EventStatus, MemorycardStatus,
    StreamReason, SupportedStreamConfig, SupportedStreams, SyncStatus, TimelineSlice,
    UploadCategory,
};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;
use timeline_core::{SyncRequest, SyncRequestStatus, SyncStatusReport, Synchronizer, period};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

// ---------------------------------------------------------------------------
// Modes
// ---------------------------------------------------------------------------

/// How event-driven recordings currently reach the cloud.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimelineSyncMode {
    None,
    /// Continuous recording published over RTMP.
    RecordRtmpPublish,
    /// Recordings land locally and upload through the synchronizer.
    ByEventDirectUpload,
    /// No usable local storage: publish live per event instead.
    ByEventRtmpPublish,
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub device_ip: String,
    pub pre_record_time: Duration,
    pub post_record_time: Duration,
    /// Delay before event-triggered records upload starts.
    pub event_sync_delay: Duration,
}

/// Per-event records-delivery binding, handed back by the event engine on
/// stop and continuation ticks.
#[derive(Debug)]
pub struct SyncBinding {
    mode: TimelineSyncMode,
    request: Option<SyncRequest>,
    stream_id: String,
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

pub struct Manager {
    weak: Weak<Manager>,
    cfg: ManagerConfig,
    session: SessionHandle,
    synchronizer: Synchronizer,
    uploader: Arc<Uploader>,
    stats: Arc<Stats>,
    streams: Vec<Arc<dyn MediaStream>>,
    producers: Vec<Arc<dyn EventProducer>>,
    engine: OnceLock<EventEngine>,
    sync_mode: Mutex<TimelineSyncMode>,
    memorycard: Mutex<MemorycardStatus>,
    record_source: Option<RecordSource>,
}

impl Manager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: ManagerConfig,
        engine_cfg: EngineConfig,
        session: SessionHandle,
        synchronizer: Synchronizer,
        uploader: Arc<Uploader>,
        stats: Arc<Stats>,
        streams: Vec<Arc<dyn MediaStream>>,
        producers: Vec<Arc<dyn EventProducer>>,
    ) -> Arc<Manager> {
        let record_source = streams.first().map(|s| RecordSource::new(s.clone()));
        let manager = Arc::new_cyclic(|weak| Manager {
            weak: weak.clone(),
            cfg,
            session,
            synchronizer,
            uploader,
            stats,
            streams,
            producers: producers.clone(),
            engine: OnceLock::new(),
            sync_mode: Mutex::new(TimelineSyncMode::None),
            memorycard: Mutex::new(MemorycardStatus::Missing),
            record_source,
        });
        let engine = EventEngine::spawn(engine_cfg, producers, manager.clone());
        let _ = manager.engine.set(engine);
        manager
    }

    pub fn engine(&self) -> &EventEngine {
        self.engine.get().expect("event engine wired at construction")
    }

    pub fn sync_mode(&self) -> TimelineSyncMode {
        *self.sync_mode.lock().expect("mode lock poisoned")
    }

    pub fn set_sync_mode(&self, mode: TimelineSyncMode) {
        *self.sync_mode.lock().expect("mode lock poisoned") = mode;
    }

    pub fn set_memorycard_status(&self, status: MemorycardStatus) {
        *self.memorycard.lock().expect("memorycard lock poisoned") = status;
    }

    fn memorycard_ok(&self) -> bool {
        *self.memorycard.lock().expect("memorycard lock poisoned") == MemorycardStatus::Normal
    }

    fn lookup_stream(&self, stream_id: &str) -> Option<Arc<dyn MediaStream>> {
        self.streams.iter().find(|s| s.name() == stream_id).cloned()
    }

    fn recording_stream(&self) -> Option<Arc<dyn MediaStream>> {
        self.streams.first().cloned()
    }

    fn publish_url(&self, stream_id: &str) -> String {
        let info = self.session.info();
        let base = info
            .media_uri
            .or(info.media_server)
            .unwrap_or_default();
        let path = info.cam_path.unwrap_or_default();
        let sid = info.sid.unwrap_or_default();
        format!("{base}{path}/{stream_id}?sid={sid}")
    }

    /// Forward one synchronizer status report as a
    /// `cam_memorycard_synchronize_status` command.  Requests without a
    /// ticket are internal and not reported.
    pub fn report_sync_status(&self, report: &SyncStatusReport) {
        if report.ticket.is_empty() {
            return;
        }
        let status = match report.status {
            SyncRequestStatus::Pending => SyncStatus::Pending,
            SyncRequestStatus::Done => SyncStatus::Done,
            SyncRequestStatus::Error => SyncStatus::Error,
            SyncRequestStatus::Canceled => SyncStatus::Canceled,
        };
        info!(
            ticket = %report.ticket,
            ?status,
            progress = report.progress,
            "timeline sync request status"
        );
        self.session
            .send(CommandBody::CamMemorycardSynchronizeStatus(
                CamMemorycardSynchronizeStatus {
                    request_id: report.ticket.clone(),
                    status,
                    progress: report.progress,
                },
            ));
    }

    /// Consume synchronizer reports until the channel closes.
    pub async fn run_sync_status_loop(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<SyncStatusReport>,
    ) {
        while let Some(report) = rx.recv().await {
            self.report_sync_status(&report);
        }
    }

    // -- stream lifecycle ----------------------------------------------------

    async fn on_stream_start(&self, stream_id: &str, reason: StreamReason) -> bool {
        let Some(stream) = self.lookup_stream(stream_id) else {
            error!(stream_id, "unable to find stream");
            return false;
        };
        let url = self.publish_url(stream_id);
        info!(stream_id, ?reason, url = %url, "stream start");

        let result = match reason {
            StreamReason::Live => stream.start_live(&url).await,
            StreamReason::ServerByEvent | StreamReason::Record => {
                if reason == StreamReason::ServerByEvent && self.producers.is_empty() {
                    warn!("event driven recording requested but no event producers attached");
                    return false;
                }
                self.set_sync_mode(TimelineSyncMode::RecordRtmpPublish);
                stream.start_live(&url).await
            }
            StreamReason::RecordByEvent => {
                if self.producers.is_empty() {
                    warn!("event driven recording requested but no event producers attached");
                    return false;
                }
                if self.memorycard_ok() {
                    for producer in &self.producers {
                        producer.set_trigger_recording(
                            true,
                            self.cfg.pre_record_time,
                            self.cfg.post_record_time,
                        );
                    }
                    self.set_sync_mode(TimelineSyncMode::ByEventDirectUpload);
                    stream.start_recording(true).await
                } else {
                    warn!("storage not ready for recording, falling back to stream by event");
                    self.set_sync_mode(TimelineSyncMode::ByEventRtmpPublish);
                    true
                }
            }
        };

        info!(stream_id, ok = result, ?reason, "stream start handled");
        result
    }

    async fn on_stream_stop(&self, stream_id: &str, reason: StreamReason) -> bool {
        let Some(stream) = self.lookup_stream(stream_id) else {
            error!(stream_id, "unable to find stream");
            return false;
        };
        info!(stream_id, ?reason, "stream stop");

        match reason {
            StreamReason::Record | StreamReason::ServerByEvent => {
                self.set_sync_mode(TimelineSyncMode::None);
                stream.stop_live().await;
            }
            StreamReason::Live => stream.stop_live().await,
            StreamReason::RecordByEvent => {
                let mode = self.sync_mode();
                if mode != TimelineSyncMode::ByEventDirectUpload
                    && mode != TimelineSyncMode::ByEventRtmpPublish
                {
                    return true;
                }
                self.set_sync_mode(TimelineSyncMode::None);
                for producer in &self.producers {
                    producer.set_trigger_recording(
                        false,
                        self.cfg.pre_record_time,
                        self.cfg.post_record_time,
                    );
                }
                stream.stop_recording().await;
            }
        }
        true
    }

    // -- record event signalling (RTMP fallback mode) ------------------------

    fn notify_record_event(&self, stream_id: &str, active: bool) {
        let mut event = EventObject::new(
            EventKind::Record,
            None,
            time::to_epoch(chrono::Utc::now()),
        );
        event.active = Some(active);
        event.status = Some(EventStatus::Ok);
        event.meta = Some(serde_json::json!({ "stream_id": stream_id }));
        self.session.send(CommandBody::CamEvent(CamEvent { event }));
    }

    /// Permanent local recording tails into cloud storage through the
    /// internal stateful `timeline-sync` event: start opens an open-ended
    /// sync of the recording timeline, stop finalizes it.
    fn notify_timeline_sync(&self, active: bool) {
        let mut event = EventObject::new(
            EventKind::Custom,
            Some("timeline-sync".to_owned()),
            time::to_epoch(chrono::Utc::now()),
        );
        event.active = Some(active);
        self.engine().notify(event);
    }

    fn start_live_for_event(&self, stream_id: String) {
        let Some(manager) = self.weak.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            manager.notify_record_event(&stream_id, true);
            if let Some(stream) = manager.lookup_stream(&stream_id) {
                let url = manager.publish_url(&stream_id);
                if !stream.start_live(&url).await {
                    warn!(stream_id = %stream_id, "failed to start live publish for event");
                }
            }
        });
    }

    fn stop_live_for_event(&self, stream_id: String, delay: Duration) {
        let Some(manager) = self.weak.upgrade() else {
            return;
        };
        // Post-roll emulation: the live publish outlives the event by the
        // configured post-record time.
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            manager.notify_record_event(&stream_id, false);
            if let Some(stream) = manager.lookup_stream(&stream_id) {
                stream.stop_live().await;
            }
        });
    }

    // -- memorycard sync entry points ----------------------------------------

    fn memorycard_synchronize(
        &self,
        request_id: &str,
        start: Option<Time>,
        end: Option<Time>,
    ) -> Option<CamMemorycardSynchronizeStatus> {
        let (Some(start), Some(end)) = (start, end) else {
            return None;
        };
        self.synchronizer
            .sync(start, Some(end), request_id, Duration::ZERO);
        Some(CamMemorycardSynchronizeStatus {
            request_id: request_id.to_owned(),
            status: SyncStatus::Pending,
            progress: 0,
        })
    }

    async fn memorycard_timeline(
        &self,
        start: Option<Time>,
        end: Option<Time>,
    ) -> Option<Vec<TimelineSlice>> {
        let (Some(start), Some(end), Some(source)) = (start, end, self.record_source.as_ref())
        else {
            return None;
        };
        let items = timeline_core::TimelineSource::list(source, start, end).await;
        let slices = period::squash(items.into_iter().map(|i| i.period).collect());
        Some(
            slices
                .into_iter()
                .map(|p| TimelineSlice {
                    start: time::to_iso_packed(p.begin),
                    end: time::to_iso_packed(p.end),
                })
                .collect(),
        )
    }
}

// ---------------------------------------------------------------------------
// Inbound command dispatch
// ---------------------------------------------------------------------------

impl CommandHandler for Manager {
    async fn handle_command(&self, cmd: &Command) -> HandlerResult {
        match &cmd.body {
            CommandBody::StreamStart(start) => {
                let Some(reason) = start.reason else {
                    return HandlerResult::Done(DoneStatus::MissedParam);
                };
                if self.on_stream_start(&start.stream_id, reason).await {
                    HandlerResult::Done(DoneStatus::Ok)
                } else {
                    HandlerResult::Done(DoneStatus::CmError)
                }
            }
            CommandBody::StreamStop(stop) => {
                let Some(reason) = stop.reason else {
                    return HandlerResult::Done(DoneStatus::MissedParam);
                };
                if self.on_stream_stop(&stop.stream_id, reason).await {
                    HandlerResult::Done(DoneStatus::Ok)
                } else {
                    HandlerResult::Done(DoneStatus::CmError)
                }
            }
            CommandBody::GetCamStatus => {
                let info = self.session.info();
                HandlerResult::Reply(CommandBody::CamStatus(CamStatus {
                    ip: self.cfg.device_ip.clone(),
                    activity: info.activity,
                    streaming: self.sync_mode() != TimelineSyncMode::None,
                    status_led: false,
                }))
            }
            CommandBody::GetSupportedStreams => {
                let streams: Vec<SupportedStreamConfig> = self
                    .streams
                    .iter()
                    .map(|s| SupportedStreamConfig {
                        id: s.name().to_owned(),
                        video: Some(format!("{}.video", s.name())),
                        audio: None,
                    })
                    .collect();
                let video_es = streams.iter().filter_map(|s| s.video.clone()).collect();
                HandlerResult::Reply(CommandBody::SupportedStreams(SupportedStreams {
                    streams,
                    video_es,
                    audio_es: Vec::new(),
                }))
            }
            CommandBody::GetCamEvents => {
                let config = self.engine().get_events().await;
                HandlerResult::Reply(CommandBody::CamEventsConf(CamEventsConf { config }))
            }
            CommandBody::SetCamEvents(set) => {
                if self.engine().set_events(set.config.clone()).await {
                    HandlerResult::Done(DoneStatus::Ok)
                } else {
                    HandlerResult::Done(DoneStatus::CmError)
                }
            }
            CommandBody::CamTriggerEvent(trigger) => {
                if trigger.event.is_empty() {
                    return HandlerResult::Done(DoneStatus::InvalidParam);
                }
                let t = trigger
                    .time
                    .and_then(time::from_epoch)
                    .unwrap_or_else(chrono::Utc::now);
                if self
                    .engine()
                    .trigger(&trigger.event, trigger.meta.clone(), t)
                    .await
                {
                    HandlerResult::Done(DoneStatus::Ok)
                } else {
                    HandlerResult::Done(DoneStatus::InvalidParam)
                }
            }
            CommandBody::CamMemorycardSynchronize(sync) => {
                for canceled in &sync.cancel_requests {
                    self.synchronizer.sync_cancel(canceled.clone());
                }
                match self.memorycard_synchronize(
                    &sync.request_id,
                    time::from_iso(&sync.start),
                    time::from_iso(&sync.end),
                ) {
                    Some(status) => HandlerResult::Reply(
                        CommandBody::CamMemorycardSynchronizeStatus(status),
                    ),
                    None => HandlerResult::Done(DoneStatus::MissedParam),
                }
            }
            CommandBody::CamMemorycardSynchronizeCancel(cancel) => {
                // Always succeeds, even with nothing left to cancel.
                self.synchronizer.sync_cancel(cancel.request_id.clone());
                HandlerResult::Done(DoneStatus::Ok)
            }
            CommandBody::GetCamMemorycardTimeline(get) => {
                match self
                    .memorycard_timeline(time::from_iso(&get.start), time::from_iso(&get.end))
                    .await
                {
                    Some(data) => HandlerResult::Reply(CommandBody::CamMemorycardTimeline(
                        agent_proto::CamMemorycardTimeline {
                            request_id: get.request_id.clone(),
                            start: get.start.clone(),
                            end: get.end.clone(),
                            data,
                        },
                    )),
                    None => HandlerResult::Done(DoneStatus::CmError),
                }
            }
            CommandBody::CamMemorycardRecording(recording) => {
                if let Some(stream) = self.lookup_stream(&recording.stream_id) {
                    if recording.enabled {
                        let ok = stream.start_recording(false).await;
                        info!(ok, "permanent recording start requested");
                        if ok {
                            self.notify_timeline_sync(true);
                        }
                    } else {
                        stream.stop_recording().await;
                        info!("permanent recording stopped");
                        self.notify_timeline_sync(false);
                    }
                }
                HandlerResult::Done(DoneStatus::Ok)
            }
            other => {
                debug!(cmd = other.name(), "command not supported");
                HandlerResult::Done(DoneStatus::NotSupported)
            }
        }
    }

    async fn on_ready(&self) {
        info!("control session ready");
    }

    async fn on_closed(&self, reason: ByeReason) {
        self.stats.cloud_reconnects.fetch_add(1, Ordering::Relaxed);
        info!(?reason, "control session closed");
    }
}

// ---------------------------------------------------------------------------
// Event sink
// ---------------------------------------------------------------------------

impl EventSink for Manager {
    type SyncHandle = SyncBinding;

    fn on_event_start(&self, config: &EventConfig, t: Time) {
        debug!(event = %config.name(), time = %time::to_iso(t), "event start");
    }

    fn on_event_stop(&self, config: &EventConfig, t: Time) {
        debug!(event = %config.name(), time = %time::to_iso(t), "event stop");
    }

    fn on_event_trigger(&self, config: &EventConfig, t: Time) {
        debug!(event = %config.name(), time = %time::to_iso(t), "event trigger");
    }

    fn on_event_continue(&self, config: &EventConfig, t: Time) {
        debug!(event = %config.name(), time = %time::to_iso_packed(t), "event ongoing");
    }

    fn on_stream_sync_start(&self, config: &EventConfig, t: Time) -> Option<SyncBinding> {
        let mode = self.sync_mode();
        let stream_id = self
            .recording_stream()
            .map(|s| s.name().to_owned())
            .unwrap_or_default();
        info!(
            event = %config.name(),
            time = %time::to_iso(t),
            ?mode,
            "records delivery start"
        );

        // The internal tail-sync event follows the active mode but starts
        // immediately and from the event instant.
        if config.name() == "timeline-sync" {
            let request = self.synchronizer.sync(t, None, "", Duration::ZERO);
            return Some(SyncBinding {
                mode,
                request: Some(request),
                stream_id,
            });
        }

        match mode {
            TimelineSyncMode::ByEventDirectUpload => {
                let begin = t
                    - chrono::TimeDelta::from_std(self.cfg.pre_record_time)
                        .unwrap_or_else(|_| chrono::TimeDelta::seconds(10));
                let request = self
                    .synchronizer
                    .sync(begin, None, "", self.cfg.event_sync_delay);
                Some(SyncBinding {
                    mode,
                    request: Some(request),
                    stream_id,
                })
            }
            TimelineSyncMode::ByEventRtmpPublish => {
                self.start_live_for_event(stream_id.clone());
                Some(SyncBinding {
                    mode,
                    request: None,
                    stream_id,
                })
            }
            TimelineSyncMode::RecordRtmpPublish => {
                // Cloud-side recording is already running over RTMP.
                Some(SyncBinding {
                    mode,
                    request: None,
                    stream_id,
                })
            }
            TimelineSyncMode::None => {
                info!("records delivery not required in current mode");
                None
            }
        }
    }

    fn on_stream_sync_stop(&self, config: &EventConfig, t: Time, handle: Option<SyncBinding>) {
        let Some(binding) = handle else {
            return;
        };
        info!(
            event = %config.name(),
            time = %time::to_iso(t),
            mode = ?binding.mode,
            "records delivery stop"
        );

        if config.name() == "timeline-sync" {
            if let Some(request) = binding.request {
                self.synchronizer.sync_finalize(request, t);
            }
            return;
        }

        match binding.mode {
            TimelineSyncMode::ByEventDirectUpload => {
                if let Some(request) = binding.request {
                    let end = t
                        + chrono::TimeDelta::from_std(self.cfg.post_record_time)
                            .unwrap_or_else(|_| chrono::TimeDelta::seconds(10));
                    self.synchronizer.sync_finalize(request, end);
                }
            }
            TimelineSyncMode::ByEventRtmpPublish => {
                self.stop_live_for_event(binding.stream_id, self.cfg.post_record_time);
            }
            TimelineSyncMode::RecordRtmpPublish | TimelineSyncMode::None => {}
        }
    }

    fn on_stream_sync_continue(
        &self,
        config: &EventConfig,
        t: Time,
        handle: Option<SyncBinding>,
    ) -> Option<SyncBinding> {
        let current = self.sync_mode();
        let mut handle = handle;

        let mode_changed = config.name() != "timeline-sync"
            && handle.as_ref().is_some_and(|b| b.mode != current);
        if mode_changed && let Some(binding) = handle.take() {
            info!(
                old = ?binding.mode,
                new = ?current,
                "records delivery mode changed, switching"
            );
            match binding.mode {
                TimelineSyncMode::ByEventRtmpPublish => {
                    // Stop the emulated publish immediately, no post-roll.
                    self.notify_record_event(&binding.stream_id, false);
                    let Some(manager) = self.weak.upgrade() else {
                        return None;
                    };
                    let stream_id = binding.stream_id.clone();
                    tokio::spawn(async move {
                        if let Some(stream) = manager.lookup_stream(&stream_id) {
                            stream.stop_live().await;
                        }
                    });
                }
                TimelineSyncMode::ByEventDirectUpload => {
                    if let Some(request) = binding.request {
                        self.synchronizer.sync_finalize(request, t);
                    }
                }
                _ => {}
            }
        }

        if handle.is_none()
            && matches!(
                current,
                TimelineSyncMode::ByEventDirectUpload | TimelineSyncMode::ByEventRtmpPublish
            )
        {
            handle = self.on_stream_sync_start(config, t);
        }

        handle
    }

    fn on_event_payload(&self, event: EventObject, need_snapshot: bool) {
        if event.event == EventKind::Motion && !event.state_emulation {
            self.stats.motion_events.fetch_add(1, Ordering::Relaxed);
        }
        if let Some(info) = &event.memorycard_info {
            info!(status = ?info.status, "memorycard event");
            self.set_memorycard_status(info.status);
        }

        let Some(manager) = self.weak.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            manager.ship_event(event, need_snapshot).await;
        });
    }
}

impl Manager {
    /// Capture the requested payloads and ship the event.  A payload over
    /// its concurrency cap is dropped; the event always goes out.
    async fn ship_event(&self, mut event: EventObject, need_snapshot: bool) {
        let mut payloads = Vec::new();

        if need_snapshot {
            match self.recording_stream() {
                Some(stream) => match stream.get_snapshot().await {
                    Some(snapshot) => {
                        if let Some(permit) = self.uploader.try_acquire(UploadCategory::Snapshot) {
                            self.stats.snapshots_uploading.fetch_add(1, Ordering::Relaxed);
                            event.snapshot_info = Some(agent_proto::SnapshotInfo {
                                image_time: time::to_iso_packed(snapshot.time),
                                width: snapshot.width,
                                height: snapshot.height,
                                size: snapshot.data.len() as u64,
                                image_data: Vec::new(),
                            });
                            payloads.push(EventPayload {
                                category: UploadCategory::Snapshot,
                                data: snapshot.data,
                                permit,
                            });
                        }
                    }
                    None => {
                        self.stats
                            .snapshots_capture_failed
                            .fetch_add(1, Ordering::Relaxed);
                        warn!(event = %event.name(), "snapshot capture failed");
                    }
                },
                None => {
                    self.stats
                        .snapshots_capture_failed
                        .fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        let has_meta = !event.state_emulation
            && event
                .file_meta_info
                .as_ref()
                .is_some_and(|meta| !meta.data.is_empty());
        if has_meta {
            match self.uploader.try_acquire(UploadCategory::FileMeta) {
                Some(permit) => {
                    if let Some(meta) = event.file_meta_info.as_mut() {
                        self.stats.file_meta_uploading.fetch_add(1, Ordering::Relaxed);
                        let data = std::mem::take(&mut meta.data);
                        meta.size = data.len() as u64;
                        payloads.push(EventPayload {
                            category: UploadCategory::FileMeta,
                            data,
                            permit,
                        });
                    }
                }
                None => event.file_meta_info = None,
            }
        }

        if event.status.is_none() {
            event.status = Some(EventStatus::Ok);
        }
        self.uploader.upload_event(event, payloads).await;
    }
}
