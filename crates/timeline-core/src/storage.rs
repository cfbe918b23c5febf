//! Timed storage: items addressed by their period, plus the source / sink
//! timeline traits the synchronizer runs against.
//!
//! `VfsStorage` is the filesystem implementation; object names are the
//! packed-ISO period endpoints joined by `_`, one file per slice.

use crate::period::{self, Period};
use agent_proto::time::{self, Time};
use agent_proto::{MediaType, UploadCategory};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error};

// ---------------------------------------------------------------------------
// Items
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataState {
    Empty,
    Loaded,
    AsyncReady,
}

/// One storable slice of media.  Created by the source timeline when the
/// synchronizer lists a window; destroyed once its upload terminates.
#[derive(Debug, Clone)]
pub struct Item {
    pub period: Period,
    pub category: UploadCategory,
    pub media_type: MediaType,
    pub state: DataState,
    pub data: Vec<u8>,
}

impl Item {
    pub fn new(period: Period) -> Self {
        Item {
            period,
            category: UploadCategory::Record,
            media_type: MediaType::Mp4,
            state: DataState::Empty,
            data: Vec::new(),
        }
    }

    pub fn with_data(period: Period, data: Vec<u8>) -> Self {
        let state = if data.is_empty() {
            DataState::Empty
        } else {
            DataState::Loaded
        };
        Item {
            period,
            category: UploadCategory::Record,
            media_type: MediaType::Mp4,
            state,
            data,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.period.is_valid()
    }
}

// ---------------------------------------------------------------------------
// Cancellation probe
// ---------------------------------------------------------------------------

/// Cooperative cancellation flag handed to in-flight stores.  The upload is
/// allowed to finish; a `true` probe lets it abort early instead.
#[derive(Debug, Clone, Default)]
pub struct CancelProbe(Arc<AtomicBool>);

impl CancelProbe {
    pub fn new(flag: Arc<AtomicBool>) -> Self {
        CancelProbe(flag)
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Timeline traits
// ---------------------------------------------------------------------------

/// Where recordings come from: the local spool, SD card, or a test double.
pub trait TimelineSource: Send + Sync + 'static {
    /// Items intersecting `[begin, end)`, sorted by begin.
    fn list(&self, begin: Time, end: Time) -> impl Future<Output = Vec<Item>> + Send;

    /// Fill `item.data`; `false` means the slice could not be exported.
    fn load(&self, item: &mut Item) -> impl Future<Output = bool> + Send;
}

/// Where recordings go: cloud storage, or a test double.
pub trait TimelineSink: Send + Sync + 'static {
    /// Already-present remote data intersecting `[begin, end)`, merged.
    fn slices(&self, begin: Time, end: Time) -> impl Future<Output = Vec<Period>> + Send;

    /// Deliver one slice.  Must resolve even when `canceled` turns true
    /// mid-transfer (the result is still counted).
    fn store(&self, item: Item, canceled: CancelProbe) -> impl Future<Output = bool> + Send;
}

// ---------------------------------------------------------------------------
// Filesystem storage
// ---------------------------------------------------------------------------

/// Directory-per-timeline storage with packed-timestamp object names.
#[derive(Debug, Clone)]
pub struct VfsStorage {
    root: PathBuf,
}

impl VfsStorage {
    pub fn open(root: impl Into<PathBuf>) -> std::io::Result<Self> {
        let root = root.into();
        if !root.is_dir() {
            std::fs::create_dir_all(&root)?;
        }
        Ok(VfsStorage { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn filename(period: &Period) -> String {
        format!(
            "{}_{}",
            time::to_iso_packed(period.begin),
            time::to_iso_packed(period.end)
        )
    }

    fn period_from_filename(name: &str) -> Option<Period> {
        let (begin, end) = name.split_once('_')?;
        let period = Period::new(time::from_iso(begin)?, time::from_iso(end)?);
        period.is_valid().then_some(period)
    }

    async fn scan(&self, begin: Time, end: Time) -> Vec<Period> {
        let window = Period::new(begin, end);
        let mut result = Vec::new();
        let Ok(mut entries) = tokio::fs::read_dir(&self.root).await else {
            error!(root = %self.root.display(), "unable to read storage directory");
            return result;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            if let Some(period) = Self::period_from_filename(&entry.file_name().to_string_lossy())
                && period.intersects(&window)
            {
                result.push(period);
            }
        }
        result.sort();
        result
    }

    pub async fn store_item(&self, item: &Item) -> bool {
        if !item.is_valid() || item.data.is_empty() {
            error!("refusing to store invalid or empty item");
            return false;
        }
        let path = self.root.join(Self::filename(&item.period));
        match tokio::fs::write(&path, &item.data).await {
            Ok(()) => {
                debug!(path = %path.display(), size = item.data.len(), "item stored");
                true
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "item store failed");
                false
            }
        }
    }

    pub async fn erase(&self, item: &Item) {
        let _ = tokio::fs::remove_file(self.root.join(Self::filename(&item.period))).await;
    }
}

impl TimelineSource for VfsStorage {
    async fn list(&self, begin: Time, end: Time) -> Vec<Item> {
        self.scan(begin, end).await.into_iter().map(Item::new).collect()
    }

    async fn load(&self, item: &mut Item) -> bool {
        let path = self.root.join(Self::filename(&item.period));
        match tokio::fs::read(&path).await {
            Ok(data) => {
                item.data = data;
                item.state = DataState::Loaded;
                true
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "item load failed");
                false
            }
        }
    }
}

impl TimelineSink for VfsStorage {
    async fn slices(&self, begin: Time, end: Time) -> Vec<Period> {
        period::squash(self.scan(begin, end).await)
    }

    async fn store(&self, item: Item, canceled: CancelProbe) -> bool {
        if canceled.is_canceled() {
            return false;
        }
        self.store_item(&item).await
    }
}
