//! Agent-wide upload and session counters, attached to the periodic
//! `qos-report` event as its meta payload.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Instant;

#[derive(Debug)]
pub struct Stats {
    spawned: Instant,
    pub motion_events: AtomicU64,

    pub records_uploaded: AtomicU64,
    pub records_upload_failed: AtomicU64,
    pub records_uploading: AtomicI64,

    pub snapshots_uploaded: AtomicU64,
    pub snapshots_upload_failed: AtomicU64,
    pub snapshots_uploading: AtomicI64,
    pub snapshots_capture_failed: AtomicU64,
    pub snapshots_dropped_over_cap: AtomicU64,

    pub file_meta_uploaded: AtomicU64,
    pub file_meta_upload_failed: AtomicU64,
    pub file_meta_uploading: AtomicI64,
    pub file_meta_dropped_over_cap: AtomicU64,

    pub cloud_reconnects: AtomicU64,
}

impl Default for Stats {
    fn default() -> Self {
        Stats {
            spawned: Instant::now(),
            motion_events: AtomicU64::new(0),
            records_uploaded: AtomicU64::new(0),
            records_upload_failed: AtomicU64::new(0),
            records_uploading: AtomicI64::new(0),
            snapshots_uploaded: AtomicU64::new(0),
            snapshots_upload_failed: AtomicU64::new(0),
            snapshots_uploading: AtomicI64::new(0),
            snapshots_capture_failed: AtomicU64::new(0),
            snapshots_dropped_over_cap: AtomicU64::new(0),
            file_meta_uploaded: AtomicU64::new(0),
            file_meta_upload_failed: AtomicU64::new(0),
            file_meta_uploading: AtomicI64::new(0),
            file_meta_dropped_over_cap: AtomicU64::new(0),
            cloud_reconnects: AtomicU64::new(0),
        }
    }
}

impl Stats {
    pub fn count_upload(&self, ok: bool, uploaded: &AtomicU64, failed: &AtomicU64) {
        if ok {
            uploaded.fetch_add(1, Ordering::Relaxed);
        } else {
            failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Snapshot for the qos-report meta field.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "uptime": self.spawned.elapsed().as_secs(),
            "motion_events": self.motion_events.load(Ordering::Relaxed),
            "records_uploaded": self.records_uploaded.load(Ordering::Relaxed),
            "records_upload_failed": self.records_upload_failed.load(Ordering::Relaxed),
            "records_uploading": self.records_uploading.load(Ordering::Relaxed),
            "snapshots_uploaded": self.snapshots_uploaded.load(Ordering::Relaxed),
            "snapshots_upload_failed": self.snapshots_upload_failed.load(Ordering::Relaxed),
            "snapshots_uploading": self.snapshots_uploading.load(Ordering::Relaxed),
            "snapshots_capture_failed": self.snapshots_capture_failed.load(Ordering::Relaxed),
            "snapshots_dropped_over_cap": self.snapshots_dropped_over_cap.load(Ordering::Relaxed),
            "file_meta_uploaded": self.file_meta_uploaded.load(Ordering::Relaxed),
            "file_meta_upload_failed": self.file_meta_upload_failed.load(Ordering::Relaxed),
            "file_meta_uploading": self.file_meta_uploading.load(Ordering::Relaxed),
            "file_meta_dropped_over_cap": self.file_meta_dropped_over_cap.load(Ordering::Relaxed),
            "cloud_reconnects": self.cloud_reconnects.load(Ordering::Relaxed),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_snapshot_carries_counters() {
        let stats = Stats::default();
        stats.records_uploaded.fetch_add(3, Ordering::Relaxed);
        stats.cloud_reconnects.fetch_add(1, Ordering::Relaxed);

        let json = stats.to_json();
        assert_eq!(json["records_uploaded"], 3);
        assert_eq!(json["cloud_reconnects"], 1);
        assert_eq!(json["snapshots_uploaded"], 0);
    }
}
