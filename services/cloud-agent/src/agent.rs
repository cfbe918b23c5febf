//! Agent assembly: builds the session, uploader, synchronizer, event engine
//! and manager from one loaded config, and owns their lifetimes.

use crate::config::AgentConfig;
use crate::events::EngineConfig;
use crate::manager::{Manager, ManagerConfig};
use crate::media::{EventProducer, MediaStream, NullSource, RecordSource};
use crate::session::{Session, SessionConfig, SessionHandle};
use crate::stats::Stats;
use crate::storage::CloudStorage;
use crate::upload::{Uploader, UploaderConfig};
use std::sync::Arc;
use timeline_core::{SyncConfig, Synchronizer};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::info;

pub struct Agent {
    pub manager: Arc<Manager>,
    pub session: SessionHandle,
    synchronizer: Synchronizer,
    shutdown: watch::Sender<bool>,
    session_task: JoinHandle<()>,
}

impl Agent {
    /// Wire and start every subsystem.  Returns once the session task is
    /// spawned; the connection itself comes and goes per the reconnect
    /// policy.
    pub fn start(
        cfg: AgentConfig,
        streams: Vec<Arc<dyn MediaStream>>,
        producers: Vec<Arc<dyn EventProducer>>,
    ) -> Agent {
        let secure = !cfg.cloud.insecure_cloud_channel;
        let control_url = format!("{}/ctl", cfg.access_token.cam_uri(secure));

        let session = Session::new(SessionConfig::new(
            control_url,
            cfg.device.clone(),
            cfg.access_token.token.clone(),
        ));
        let handle = session.handle.clone();

        let stats = Arc::new(Stats::default());
        let uploader = Arc::new(Uploader::new(
            handle.clone(),
            UploaderConfig {
                max_concurrent_video_uploads: cfg.uploads.max_concurrent_video_uploads,
                max_concurrent_snapshot_uploads: cfg.uploads.max_concurrent_snapshot_uploads,
                max_concurrent_file_meta_uploads: cfg.uploads.max_concurrent_file_meta_uploads,
                max_upload_speed: cfg.uploads.max_upload_speed,
                max_video_uploads_queue_lateness: cfg.uploads.max_video_uploads_queue_lateness,
            },
            stats.clone(),
            cfg.cloud.allow_invalid_ssl_certs,
            cfg.access_token.socks5_proxy(),
        ));

        let (status_tx, status_rx) = mpsc::unbounded_channel();
        let recording_stream_id = streams
            .first()
            .map(|s| s.name().to_owned())
            .unwrap_or_default();
        let destination = CloudStorage::new(
            cfg.access_token.clone(),
            secure,
            cfg.cloud.allow_invalid_ssl_certs,
            uploader.clone(),
            recording_stream_id,
        );
        let sync_config = SyncConfig {
            step: cfg.sync.record_by_event_upload_step,
        };
        let synchronizer = match streams.first() {
            Some(stream) => Synchronizer::spawn(
                sync_config,
                RecordSource::new(stream.clone()),
                destination,
                status_tx,
            ),
            None => Synchronizer::spawn(sync_config, NullSource, destination, status_tx),
        };

        let qos_stats = stats.clone();
        let manager = Manager::new(
            ManagerConfig {
                device_ip: cfg.device.ip.clone(),
                pre_record_time: cfg.sync.pre_record_time,
                post_record_time: cfg.sync.post_record_time,
                event_sync_delay: cfg.sync.delay_between_event_and_records_upload_start,
            },
            EngineConfig {
                send_qos_report_as_separate_event: cfg.events.send_qos_report_as_separate_event,
                send_qos_report_period: cfg.events.send_qos_report_period,
                stateful_event_continuation_kick_snapshot: cfg
                    .events
                    .stateful_event_continuation_kick_snapshot,
                qos_meta: Some(Arc::new(move || qos_stats.to_json())),
            },
            handle.clone(),
            synchronizer.clone(),
            uploader,
            stats,
            streams,
            producers,
        );

        tokio::spawn(manager.clone().run_sync_status_loop(status_rx));

        let (shutdown, shutdown_rx) = watch::channel(false);
        let session_task = tokio::spawn(session.run(manager.clone(), shutdown_rx));
        info!("agent started");

        Agent {
            manager,
            session: handle,
            synchronizer,
            shutdown,
            session_task,
        }
    }

    /// Graceful teardown: close the session, stop the event engine (pairing
    /// every open stateful event with a stop), and drain the synchronizer.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        self.manager.engine().stop().await;
        self.synchronizer.stop().await;
        let _ = self.session_task.await;
        info!("agent stopped");
    }
}
