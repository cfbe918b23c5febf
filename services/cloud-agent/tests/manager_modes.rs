//! Manager-level tests: stream_start/stop mode translation, memorycard
//! command handling, and the mid-event delivery-mode hand-off.

use agent_proto::{
    CamMemorycardRecording, CamMemorycardSynchronize, Command, CommandBody, DoneStatus, EventCaps,
    EventConfig, EventKind, GetCamMemorycardTimeline, MemorycardStatus, StreamReason, StreamStart,
    StreamStop,
};
use async_trait::async_trait;
use cloud_agent::config::DeviceConfig;
use cloud_agent::events::{EngineConfig, EventSink};
use cloud_agent::manager::{Manager, ManagerConfig, TimelineSyncMode};
use cloud_agent::media::{EventProducer, MediaStream, RecordClip, Snapshot};
use cloud_agent::session::{CommandHandler, HandlerResult, Session, SessionConfig};
use cloud_agent::stats::Stats;
use cloud_agent::upload::{Uploader, UploaderConfig};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use timeline_core::{
    CancelProbe, Item, Period, SyncConfig, SyncRequestStatus, SyncStatusReport, Synchronizer, Time,
    TimelineSink, TimelineSource, period,
};
use tokio::sync::mpsc;

const EPOCH: i64 = 1_700_000_000;

fn at(secs: i64) -> Time {
    use chrono::TimeZone;
    chrono::Utc.timestamp_opt(EPOCH + secs, 0).unwrap()
}

fn p(b: i64, e: i64) -> Period {
    Period::new(at(b), at(e))
}

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FakeStream {
    live: AtomicBool,
    recording: AtomicBool,
    by_event: AtomicBool,
    clips: Mutex<Vec<Period>>,
}

#[async_trait]
impl MediaStream for FakeStream {
    fn name(&self) -> &str {
        "Main"
    }

    async fn start_live(&self, _publish_url: &str) -> bool {
        self.live.store(true, Ordering::SeqCst);
        true
    }

    async fn stop_live(&self) {
        self.live.store(false, Ordering::SeqCst);
    }

    async fn start_recording(&self, by_event: bool) -> bool {
        self.recording.store(true, Ordering::SeqCst);
        self.by_event.store(by_event, Ordering::SeqCst);
        true
    }

    async fn stop_recording(&self) {
        self.recording.store(false, Ordering::SeqCst);
    }

    async fn get_snapshot(&self) -> Option<Snapshot> {
        Some(Snapshot {
            time: at(0),
            width: 800,
            height: 600,
            data: vec![0xFF; 16],
        })
    }

    async fn record_get_list(&self, begin: Time, end: Time) -> Vec<RecordClip> {
        let window = Period::new(begin, end);
        self.clips
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.intersects(&window))
            .map(|c| RecordClip { period: *c })
            .collect()
    }

    async fn record_export(&self, _begin: Time, _end: Time) -> Option<Vec<u8>> {
        Some(vec![0xAB; 32])
    }
}

#[derive(Default)]
struct FakeProducer {
    trigger_recording: Mutex<Option<bool>>,
}

impl EventProducer for FakeProducer {
    fn name(&self) -> &str {
        "fake"
    }
    fn events(&self) -> Vec<EventConfig> {
        let mut conf = EventConfig {
            event: EventKind::Motion,
            custom_event_name: None,
            caps: EventCaps::default(),
            active: true,
            stream: true,
            snapshot: false,
            period: 0,
        };
        conf.caps.stateful = true;
        conf.caps.stream = true;
        vec![conf]
    }
    fn start(&self, _notify: mpsc::UnboundedSender<agent_proto::EventObject>) {}
    fn stop(&self) {}
    fn set_events(&self, _configs: &[EventConfig]) {}
    fn trigger(&self, _event: agent_proto::EventObject) -> bool {
        true
    }
    fn set_trigger_recording(&self, enabled: bool, _pre: Duration, _post: Duration) {
        *self.trigger_recording.lock().unwrap() = Some(enabled);
    }
}

#[derive(Clone)]
struct ContinuousSource {
    extent: Period,
}

impl TimelineSource for ContinuousSource {
    async fn list(&self, begin: Time, end: Time) -> Vec<Item> {
        let b = begin.max(self.extent.begin);
        let e = end.min(self.extent.end);
        if b < e {
            vec![Item::new(Period::new(b, e))]
        } else {
            vec![]
        }
    }

    async fn load(&self, item: &mut Item) -> bool {
        item.data = vec![0xAB; 64];
        true
    }
}

#[derive(Clone, Default)]
struct RecordingSink {
    stored: Arc<Mutex<Vec<Period>>>,
}

impl TimelineSink for RecordingSink {
    async fn slices(&self, begin: Time, end: Time) -> Vec<Period> {
        let window = Period::new(begin, end);
        let stored = self.stored.lock().unwrap().clone();
        period::squash(
            stored
                .into_iter()
                .filter(|s| s.intersects(&window))
                .collect(),
        )
    }

    async fn store(&self, item: Item, canceled: CancelProbe) -> bool {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if canceled.is_canceled() {
            return false;
        }
        self.stored.lock().unwrap().push(item.period);
        true
    }
}

// ---------------------------------------------------------------------------
// Rig
// ---------------------------------------------------------------------------

struct Rig {
    manager: Arc<Manager>,
    stream: Arc<FakeStream>,
    producer: Arc<FakeProducer>,
    sink: RecordingSink,
    status_rx: mpsc::UnboundedReceiver<SyncStatusReport>,
}

fn rig(source_extent: Period) -> Rig {
    let device = DeviceConfig {
        vendor: "acme".to_owned(),
        brand: "acme".to_owned(),
        model: "cam-1".to_owned(),
        serial: "sn-1".to_owned(),
        fw_version: "1.0".to_owned(),
        device_type: "ipcam".to_owned(),
        ip: "127.0.0.1".to_owned(),
        agent_version: "0.1.0".to_owned(),
        timezone: "UTC".to_owned(),
    };
    let session = Session::new(SessionConfig::new(
        "ws://127.0.0.1:1".to_owned(),
        device,
        "tok".to_owned(),
    ));
    let stats = Arc::new(Stats::default());
    let uploader = Arc::new(Uploader::new(
        session.handle.clone(),
        UploaderConfig {
            max_concurrent_video_uploads: 2,
            max_concurrent_snapshot_uploads: 4,
            max_concurrent_file_meta_uploads: 6,
            max_upload_speed: 0,
            max_video_uploads_queue_lateness: Duration::from_secs(1800),
        },
        stats.clone(),
        false,
        None,
    ));

    let (status_tx, status_rx) = mpsc::unbounded_channel();
    let sink = RecordingSink::default();
    let synchronizer = Synchronizer::spawn(
        SyncConfig::default(),
        ContinuousSource {
            extent: source_extent,
        },
        sink.clone(),
        status_tx,
    );

    let stream = Arc::new(FakeStream::default());
    let producer = Arc::new(FakeProducer::default());
    let manager = Manager::new(
        ManagerConfig {
            device_ip: "127.0.0.1".to_owned(),
            pre_record_time: Duration::from_secs(5),
            post_record_time: Duration::from_secs(5),
            event_sync_delay: Duration::ZERO,
        },
        EngineConfig {
            send_qos_report_as_separate_event: false,
            send_qos_report_period: Duration::from_secs(600),
            stateful_event_continuation_kick_snapshot: true,
            qos_meta: None,
        },
        session.handle.clone(),
        synchronizer,
        uploader,
        stats,
        vec![stream.clone() as Arc<dyn MediaStream>],
        vec![producer.clone() as Arc<dyn EventProducer>],
    );

    Rig {
        manager,
        stream,
        producer,
        sink,
        status_rx,
    }
}

fn motion_config() -> EventConfig {
    let mut conf = EventConfig {
        event: EventKind::Motion,
        custom_event_name: None,
        caps: EventCaps::default(),
        active: true,
        stream: true,
        snapshot: false,
        period: 0,
    };
    conf.caps.stateful = true;
    conf.caps.stream = true;
    conf
}

async fn dispatch(manager: &Manager, body: CommandBody) -> HandlerResult {
    let cmd = Command::new(100, body);
    manager.handle_command(&cmd).await
}

async fn wait_terminal(rx: &mut mpsc::UnboundedReceiver<SyncStatusReport>) -> SyncStatusReport {
    tokio::time::timeout(Duration::from_secs(3600), async {
        loop {
            let report = rx.recv().await.expect("status channel closed");
            if report.is_terminal() {
                return report;
            }
        }
    })
    .await
    .expect("no terminal sync status")
}

// ---------------------------------------------------------------------------
// Stream lifecycle
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn record_by_event_with_memorycard_uses_direct_upload() {
    let r = rig(p(0, 1000));
    r.manager.set_memorycard_status(MemorycardStatus::Normal);

    let result = dispatch(
        &r.manager,
        CommandBody::StreamStart(StreamStart {
            stream_id: "Main".to_owned(),
            publish_session_id: None,
            reason: Some(StreamReason::RecordByEvent),
        }),
    )
    .await;

    assert!(matches!(result, HandlerResult::Done(DoneStatus::Ok)));
    assert_eq!(r.manager.sync_mode(), TimelineSyncMode::ByEventDirectUpload);
    assert!(r.stream.recording.load(Ordering::SeqCst));
    assert!(r.stream.by_event.load(Ordering::SeqCst));
    assert_eq!(*r.producer.trigger_recording.lock().unwrap(), Some(true));
}

#[tokio::test(start_paused = true)]
async fn record_by_event_without_memorycard_falls_back_to_publish() {
    let r = rig(p(0, 1000));
    r.manager.set_memorycard_status(MemorycardStatus::Missing);

    let result = dispatch(
        &r.manager,
        CommandBody::StreamStart(StreamStart {
            stream_id: "Main".to_owned(),
            publish_session_id: None,
            reason: Some(StreamReason::RecordByEvent),
        }),
    )
    .await;

    assert!(matches!(result, HandlerResult::Done(DoneStatus::Ok)));
    assert_eq!(r.manager.sync_mode(), TimelineSyncMode::ByEventRtmpPublish);
    assert!(!r.stream.recording.load(Ordering::SeqCst));
}

#[tokio::test(start_paused = true)]
async fn stream_stop_resets_mode_and_triggers() {
    let r = rig(p(0, 1000));
    r.manager.set_memorycard_status(MemorycardStatus::Normal);

    dispatch(
        &r.manager,
        CommandBody::StreamStart(StreamStart {
            stream_id: "Main".to_owned(),
            publish_session_id: None,
            reason: Some(StreamReason::RecordByEvent),
        }),
    )
    .await;
    dispatch(
        &r.manager,
        CommandBody::StreamStop(StreamStop {
            stream_id: "Main".to_owned(),
            reason: Some(StreamReason::RecordByEvent),
        }),
    )
    .await;

    assert_eq!(r.manager.sync_mode(), TimelineSyncMode::None);
    assert!(!r.stream.recording.load(Ordering::SeqCst));
    assert_eq!(*r.producer.trigger_recording.lock().unwrap(), Some(false));
}

#[tokio::test(start_paused = true)]
async fn unknown_stream_is_rejected() {
    let r = rig(p(0, 1000));
    let result = dispatch(
        &r.manager,
        CommandBody::StreamStart(StreamStart {
            stream_id: "nope".to_owned(),
            publish_session_id: None,
            reason: Some(StreamReason::Live),
        }),
    )
    .await;
    assert!(matches!(result, HandlerResult::Done(DoneStatus::CmError)));
}

// ---------------------------------------------------------------------------
// Memorycard commands
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn memorycard_timeline_reports_squashed_slices() {
    let r = rig(p(0, 1000));
    *r.stream.clips.lock().unwrap() = vec![p(0, 10), p(10, 20), p(40, 50)];

    let result = dispatch(
        &r.manager,
        CommandBody::GetCamMemorycardTimeline(GetCamMemorycardTimeline {
            request_id: "tl-1".to_owned(),
            start: agent_proto::time::to_iso_packed(at(0)),
            end: agent_proto::time::to_iso_packed(at(100)),
        }),
    )
    .await;

    match result {
        HandlerResult::Reply(CommandBody::CamMemorycardTimeline(timeline)) => {
            assert_eq!(timeline.request_id, "tl-1");
            assert_eq!(timeline.data.len(), 2);
            assert_eq!(timeline.data[0].start, agent_proto::time::to_iso_packed(at(0)));
            assert_eq!(timeline.data[0].end, agent_proto::time::to_iso_packed(at(20)));
        }
        other => panic!("expected timeline reply, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn memorycard_synchronize_runs_to_done() {
    let mut r = rig(p(70, 150));

    let result = dispatch(
        &r.manager,
        CommandBody::CamMemorycardSynchronize(CamMemorycardSynchronize {
            request_id: "req-1".to_owned(),
            start: agent_proto::time::to_iso_packed(at(70)),
            end: agent_proto::time::to_iso_packed(at(85)),
            cancel_requests: Vec::new(),
        }),
    )
    .await;

    match result {
        HandlerResult::Reply(CommandBody::CamMemorycardSynchronizeStatus(status)) => {
            assert_eq!(status.request_id, "req-1");
            assert_eq!(status.status, agent_proto::SyncStatus::Pending);
        }
        other => panic!("expected pending status reply, got {other:?}"),
    }

    let terminal = wait_terminal(&mut r.status_rx).await;
    assert_eq!(terminal.ticket, "req-1");
    assert_eq!(terminal.status, SyncRequestStatus::Done);
    assert_eq!(period::squash(r.sink.stored.lock().unwrap().clone()), vec![p(70, 85)]);
}

#[tokio::test(start_paused = true)]
async fn memorycard_synchronize_with_bad_times_is_rejected() {
    let r = rig(p(0, 1000));
    let result = dispatch(
        &r.manager,
        CommandBody::CamMemorycardSynchronize(CamMemorycardSynchronize {
            request_id: "req-2".to_owned(),
            start: "garbage".to_owned(),
            end: "garbage".to_owned(),
            cancel_requests: Vec::new(),
        }),
    )
    .await;
    assert!(matches!(result, HandlerResult::Done(DoneStatus::MissedParam)));
}

// ---------------------------------------------------------------------------
// Mid-event delivery-mode hand-off
// ---------------------------------------------------------------------------

/// The operating mode flips from NONE to BY_EVENT_DIRECT_UPLOAD while an
/// event is active: the continuation tick starts records delivery, the stop
/// finalizes it at stop + post-roll.  The remote slice begins at the
/// mode-switch instant (the recording only exists from there) and ends at
/// event stop + post_record_time.
#[tokio::test(start_paused = true)]
async fn mode_switch_mid_event_restarts_delivery() {
    let mut r = rig(p(110, 400));
    let config = motion_config();

    // Event starts at T=100 with no delivery mode active.
    let binding = r.manager.on_stream_sync_start(&config, at(100));
    assert!(binding.is_none());

    // Mode flips at T+10; the next continuation tick performs the hand-off.
    r.manager.set_sync_mode(TimelineSyncMode::ByEventDirectUpload);
    let binding = r.manager.on_stream_sync_continue(&config, at(110), None);
    assert!(binding.is_some());

    // Event stops at T+20.
    r.manager.on_stream_sync_stop(&config, at(120), binding);

    let terminal = wait_terminal(&mut r.status_rx).await;
    assert_eq!(terminal.status, SyncRequestStatus::Done);

    let stored = period::squash(r.sink.stored.lock().unwrap().clone());
    assert_eq!(stored, vec![p(110, 125)]);
}

/// Enabling permanent recording opens an open-ended sync of the recording
/// timeline through the internal timeline-sync event; disabling finalizes
/// it and the delivered range terminates DONE.
#[tokio::test(start_paused = true)]
async fn permanent_recording_drives_timeline_sync() {
    use chrono::TimeZone;

    // The recording extent must cover the wall-clock instants the internal
    // event stamps, so make it span far into the future.
    let extent = Period::new(
        chrono::Utc.timestamp_opt(0, 0).unwrap(),
        chrono::Utc.timestamp_opt(10_000_000_000, 0).unwrap(),
    );
    let mut r = rig(extent);

    let result = dispatch(
        &r.manager,
        CommandBody::CamMemorycardRecording(CamMemorycardRecording {
            stream_id: "Main".to_owned(),
            enabled: true,
        }),
    )
    .await;
    assert!(matches!(result, HandlerResult::Done(DoneStatus::Ok)));
    assert!(r.stream.recording.load(Ordering::SeqCst));

    // Let the tail sync deliver at least one chunk, then stop recording.
    tokio::time::sleep(Duration::from_secs(5)).await;
    dispatch(
        &r.manager,
        CommandBody::CamMemorycardRecording(CamMemorycardRecording {
            stream_id: "Main".to_owned(),
            enabled: false,
        }),
    )
    .await;
    assert!(!r.stream.recording.load(Ordering::SeqCst));

    let terminal = wait_terminal(&mut r.status_rx).await;
    assert_eq!(terminal.status, SyncRequestStatus::Done);
    assert!(!r.sink.stored.lock().unwrap().is_empty());
}

/// The reverse hand-off: direct upload is active, the mode drops to NONE,
/// and the continuation tick finalizes the running request.
#[tokio::test(start_paused = true)]
async fn mode_drop_finalizes_running_delivery() {
    let mut r = rig(p(0, 400));
    let config = motion_config();

    r.manager.set_sync_mode(TimelineSyncMode::ByEventDirectUpload);
    let binding = r.manager.on_stream_sync_start(&config, at(10));
    assert!(binding.is_some());

    tokio::time::sleep(Duration::from_secs(20)).await;

    r.manager.set_sync_mode(TimelineSyncMode::None);
    let binding = r.manager.on_stream_sync_continue(&config, at(30), binding);
    assert!(binding.is_none());

    let terminal = wait_terminal(&mut r.status_rx).await;
    assert_eq!(terminal.status, SyncRequestStatus::Done);

    let stored = period::squash(r.sink.stored.lock().unwrap().clone());
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].begin, at(5));
}
