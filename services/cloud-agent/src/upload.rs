//! Direct-upload orchestrator.
//!
//! Every payload (sync chunk, event snapshot, file meta) needs a cloud-issued
//! URL: the orchestrator sends `get_direct_upload_url` (or the `cam_event`
//! carrying the payload descriptors) over the control plane with a 20 s ack
//! window, then PUTs the bytes to the issued URL, forwarding every issued
//! header except `Content-Length`.  Per-category semaphores cap concurrency;
//! when the snapshot or file-meta cap is hit the payload is dropped and the
//! event ships without it.

use crate::session::{AckResult, SessionHandle};
use crate::stats::Stats;
use agent_proto::time;
use agent_proto::{
    CamEvent, Command, CommandBody, DirectUploadUrlEntry, EventObject, GetDirectUploadUrl,
    UploadCategory,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use timeline_core::{CancelProbe, Item};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

const URL_ACK_TIMEOUT: Duration = Duration::from_secs(20);
/// Rate-capped uploads go out in chunks of this size.
const UPLOAD_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct UploaderConfig {
    pub max_concurrent_video_uploads: usize,
    pub max_concurrent_snapshot_uploads: usize,
    pub max_concurrent_file_meta_uploads: usize,
    /// Bytes/s per PUT; 0 = unlimited.
    pub max_upload_speed: u64,
    /// Sync chunks older than this are dropped instead of uploaded.
    pub max_video_uploads_queue_lateness: Duration,
}

pub struct Uploader {
    session: SessionHandle,
    http: reqwest::Client,
    cfg: UploaderConfig,
    stats: Arc<Stats>,
    video_permits: Arc<Semaphore>,
    snapshot_permits: Arc<Semaphore>,
    file_meta_permits: Arc<Semaphore>,
}

/// One payload riding a `cam_event`.
pub struct EventPayload {
    pub category: UploadCategory,
    pub data: Vec<u8>,
    /// Held for the duration of the upload; acquired before the URL request.
    pub permit: OwnedSemaphorePermit,
}

/// Shared HTTP client construction: TLS policy plus the optional SOCKS5
/// proxy from the access token.
pub fn build_http_client(allow_invalid_certs: bool, socks5_proxy: Option<&str>) -> reqwest::Client {
    let mut builder = reqwest::Client::builder()
        .danger_accept_invalid_certs(allow_invalid_certs)
        .connect_timeout(Duration::from_secs(30));
    if let Some(proxy_uri) = socks5_proxy {
        match reqwest::Proxy::all(proxy_uri) {
            Ok(proxy) => builder = builder.proxy(proxy),
            Err(e) => warn!(proxy = proxy_uri, error = %e, "ignoring bad proxy URI"),
        }
    }
    builder.build().unwrap_or_default()
}

impl Uploader {
    pub fn new(
        session: SessionHandle,
        cfg: UploaderConfig,
        stats: Arc<Stats>,
        allow_invalid_certs: bool,
        socks5_proxy: Option<&str>,
    ) -> Self {
        let http = build_http_client(allow_invalid_certs, socks5_proxy);
        Uploader {
            session,
            http,
            video_permits: Arc::new(Semaphore::new(cfg.max_concurrent_video_uploads)),
            snapshot_permits: Arc::new(Semaphore::new(cfg.max_concurrent_snapshot_uploads)),
            file_meta_permits: Arc::new(Semaphore::new(cfg.max_concurrent_file_meta_uploads)),
            cfg,
            stats,
        }
    }

    /// Try to reserve an upload slot for an event payload.  `None` means the
    /// cap is hit: the caller ships the event without the payload.
    pub fn try_acquire(&self, category: UploadCategory) -> Option<OwnedSemaphorePermit> {
        let permits = match category {
            UploadCategory::Record => &self.video_permits,
            UploadCategory::Snapshot => &self.snapshot_permits,
            UploadCategory::FileMeta => &self.file_meta_permits,
        };
        match permits.clone().try_acquire_owned() {
            Ok(permit) => Some(permit),
            Err(_) => {
                match category {
                    UploadCategory::Snapshot => {
                        self.stats
                            .snapshots_dropped_over_cap
                            .fetch_add(1, Ordering::Relaxed);
                    }
                    UploadCategory::FileMeta => {
                        self.stats
                            .file_meta_dropped_over_cap
                            .fetch_add(1, Ordering::Relaxed);
                    }
                    UploadCategory::Record => {}
                }
                warn!(?category, "upload concurrency cap hit, dropping payload");
                None
            }
        }
    }

    /// Upload one sync chunk: URL over the control plane, then the PUT.
    /// Called from the synchronizer's store path; at-most-once per slice is
    /// guaranteed by the synchronizer's window bookkeeping.
    pub async fn upload_record(&self, item: Item, stream_id: &str, canceled: CancelProbe) -> bool {
        let age = chrono::Utc::now() - item.period.end;
        if age.to_std().unwrap_or_default() > self.cfg.max_video_uploads_queue_lateness {
            warn!(
                begin = %time::to_iso_packed(item.period.begin),
                "planned upload is too late, dropping"
            );
            return false;
        }

        let Ok(_permit) = self.video_permits.clone().acquire_owned().await else {
            return false;
        };
        if canceled.is_canceled() {
            // The request was canceled while we queued; report failure so
            // the segmenter accounts the chunk.
            return false;
        }

        let duration = item.period.duration();
        let request = GetDirectUploadUrl {
            category: item.category,
            media_type: item.media_type,
            file_time: time::to_iso_packed(item.period.begin),
            duration: Some(duration.num_milliseconds().max(0) as u64),
            duration_us: Some(duration.num_microseconds().unwrap_or(0).max(0) as u64),
            size: item.data.len() as u64,
            stream_id: Some(stream_id.to_owned()),
            memorycard_sync_ticket: None,
        };

        self.stats.records_uploading.fetch_add(1, Ordering::Relaxed);
        let ok = self.request_and_put(request, item.data, &canceled).await;
        self.stats.records_uploading.fetch_sub(1, Ordering::Relaxed);
        self.stats
            .count_upload(ok, &self.stats.records_uploaded, &self.stats.records_upload_failed);
        ok
    }

    /// Ship an event with payloads: `cam_event` asks for the upload URLs,
    /// the reply wires each payload (main entry plus `extra`, keyed by
    /// category) to its PUT.  The event itself is never dropped; a timed-out
    /// URL request only fails the payloads.
    pub async fn upload_event(&self, event: EventObject, payloads: Vec<EventPayload>) {
        let body = CommandBody::CamEvent(CamEvent { event });
        if payloads.is_empty() {
            self.session.send(body);
            return;
        }

        let reply = self
            .session
            .send_with_ack(body, Some(URL_ACK_TIMEOUT))
            .await;

        let mut by_category: BTreeMap<&'static str, EventPayload> = BTreeMap::new();
        for payload in payloads {
            by_category.insert(category_key(payload.category), payload);
        }

        let urls = match reply {
            AckResult::TimedOut => {
                warn!("no direct_upload_url reply for cam_event, dropping payloads");
                self.fail_payloads(by_category.into_values());
                return;
            }
            AckResult::Reply(cmd) => match cmd.body {
                CommandBody::DirectUploadUrl(urls) if urls.status == "OK" => urls,
                other => {
                    warn!(reply = other.name(), "bad reply to direct upload request");
                    self.fail_payloads(by_category.into_values());
                    return;
                }
            },
        };

        // Main entry first; old clouds omit its category when there is only
        // one payload.
        let mut entries: Vec<DirectUploadUrlEntry> = Vec::with_capacity(1 + urls.extra.len());
        entries.push(DirectUploadUrlEntry {
            status: urls.status,
            url: urls.url,
            headers: urls.headers,
            category: urls.category,
        });
        entries.extend(urls.extra);

        let mut puts = Vec::new();
        for entry in entries {
            if entry.status != "OK" {
                continue;
            }
            let payload = match entry.category {
                Some(category) => by_category.remove(category_key(category)),
                None => by_category
                    .keys()
                    .next()
                    .copied()
                    .and_then(|k| by_category.remove(k)),
            };
            let Some(payload) = payload else { continue };
            let Some(url) = entry.url else {
                self.fail_payloads(std::iter::once(payload));
                continue;
            };
            puts.push(self.put_payload(url, entry.headers, payload));
        }

        self.fail_payloads(by_category.into_values());
        futures_util::future::join_all(puts).await;
    }

    async fn put_payload(
        &self,
        url: String,
        headers: BTreeMap<String, String>,
        payload: EventPayload,
    ) {
        let category = payload.category;
        let ok = self
            .put(&url, &headers, payload.data, &CancelProbe::default())
            .await;
        let _permit = payload.permit;
        match category {
            UploadCategory::Snapshot => {
                self.stats.snapshots_uploading.fetch_sub(1, Ordering::Relaxed);
                self.stats.count_upload(
                    ok,
                    &self.stats.snapshots_uploaded,
                    &self.stats.snapshots_upload_failed,
                );
            }
            UploadCategory::FileMeta => {
                self.stats.file_meta_uploading.fetch_sub(1, Ordering::Relaxed);
                self.stats.count_upload(
                    ok,
                    &self.stats.file_meta_uploaded,
                    &self.stats.file_meta_upload_failed,
                );
            }
            UploadCategory::Record => {
                self.stats.count_upload(
                    ok,
                    &self.stats.records_uploaded,
                    &self.stats.records_upload_failed,
                );
            }
        }
    }

    fn fail_payloads(&self, payloads: impl IntoIterator<Item = EventPayload>) {
        for payload in payloads {
            match payload.category {
                UploadCategory::Snapshot => {
                    self.stats.snapshots_uploading.fetch_sub(1, Ordering::Relaxed);
                    self.stats
                        .snapshots_upload_failed
                        .fetch_add(1, Ordering::Relaxed);
                }
                UploadCategory::FileMeta => {
                    self.stats.file_meta_uploading.fetch_sub(1, Ordering::Relaxed);
                    self.stats
                        .file_meta_upload_failed
                        .fetch_add(1, Ordering::Relaxed);
                }
                UploadCategory::Record => {
                    self.stats
                        .records_upload_failed
                        .fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    async fn request_and_put(
        &self,
        request: GetDirectUploadUrl,
        data: Vec<u8>,
        canceled: &CancelProbe,
    ) -> bool {
        let reply = self
            .session
            .send_with_ack(CommandBody::GetDirectUploadUrl(request), Some(URL_ACK_TIMEOUT))
            .await;

        let urls = match reply {
            AckResult::TimedOut => {
                warn!("no reply to get_direct_upload_url, dropping chunk upload");
                return false;
            }
            AckResult::Reply(cmd) => match cmd.body {
                CommandBody::DirectUploadUrl(urls) if urls.status == "OK" => urls,
                other => {
                    warn!(reply = other.name(), "bad reply to direct upload url request");
                    return false;
                }
            },
        };

        let Some(url) = urls.url else {
            warn!("direct_upload_url reply without url");
            return false;
        };
        if canceled.is_canceled() {
            info!("direct upload canceled before transfer");
            return false;
        }
        self.put(&url, &urls.headers, data, canceled).await
    }

    /// The PUT itself.  Issued headers are forwarded verbatim except
    /// `Content-Length`, which the client computes.
    async fn put(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
        data: Vec<u8>,
        canceled: &CancelProbe,
    ) -> bool {
        let size = data.len();
        let mut request = self.http.put(url);
        for (name, value) in headers {
            if name.eq_ignore_ascii_case("content-length") {
                continue;
            }
            request = request.header(name, value);
        }
        request = request.header("Content-Length", size.to_string());

        let started = tokio::time::Instant::now();
        let request = if self.cfg.max_upload_speed > 0 {
            request.body(reqwest::Body::wrap_stream(throttled_chunks(
                data,
                self.cfg.max_upload_speed,
                canceled.clone(),
            )))
        } else {
            request.body(data)
        };

        match request.send().await {
            Ok(response) if response.status().is_success() => {
                let secs = started.elapsed().as_secs_f64().max(0.001);
                info!(
                    size,
                    seconds = secs,
                    kbps = size as f64 / 1024.0 / secs,
                    "direct upload finished"
                );
                true
            }
            Ok(response) => {
                warn!(status = %response.status(), "direct upload rejected");
                false
            }
            Err(e) => {
                warn!(error = %e, "direct upload failed");
                false
            }
        }
    }
}

/// Body stream capping the transfer at `bytes_per_sec`; polls the cancel
/// probe between chunks and aborts the request when it turns true.
fn throttled_chunks(
    data: Vec<u8>,
    bytes_per_sec: u64,
    canceled: CancelProbe,
) -> impl futures_util::Stream<Item = Result<bytes::Bytes, std::io::Error>> {
    async_stream::stream! {
        let chunk_delay =
            Duration::from_secs_f64(UPLOAD_CHUNK as f64 / bytes_per_sec.max(1) as f64);
        let mut offset = 0usize;
        while offset < data.len() {
            if canceled.is_canceled() {
                yield Err(std::io::Error::other("upload canceled"));
                return;
            }
            let end = (offset + UPLOAD_CHUNK).min(data.len());
            yield Ok(bytes::Bytes::copy_from_slice(&data[offset..end]));
            offset = end;
            if offset < data.len() {
                tokio::time::sleep(chunk_delay).await;
            }
        }
        debug!(size = data.len(), "throttled body fully streamed");
    }
}

fn category_key(category: UploadCategory) -> &'static str {
    match category {
        UploadCategory::Record => "record",
        UploadCategory::Snapshot => "snapshot",
        UploadCategory::FileMeta => "file_meta",
    }
}
