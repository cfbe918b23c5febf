//! Remote timeline over the cloud storage API.
//!
//! `slices` lists already-present data through the paginated storage
//! endpoint; `store` delivers a chunk through the direct-upload orchestrator.

use crate::upload::Uploader;
use agent_proto::AccessToken;
use agent_proto::time::{self, Time};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use timeline_core::{CancelProbe, Item, Period, TimelineSink, period};
use tracing::{error, warn};

const LIST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct StorageObject {
    start: String,
    end: String,
}

#[derive(Debug, Default, Deserialize)]
struct StorageMeta {
    #[serde(default)]
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StorageDataResponse {
    #[serde(default)]
    objects: Vec<StorageObject>,
    #[serde(default)]
    meta: StorageMeta,
}

pub struct CloudStorage {
    token: AccessToken,
    api_base: String,
    http: reqwest::Client,
    uploader: Arc<Uploader>,
    /// Stream whose recordings feed this timeline.
    stream_id: String,
}

impl CloudStorage {
    pub fn new(
        token: AccessToken,
        secure: bool,
        allow_invalid_certs: bool,
        uploader: Arc<Uploader>,
        stream_id: String,
    ) -> Self {
        let http =
            crate::upload::build_http_client(allow_invalid_certs, token.socks5_proxy());
        CloudStorage {
            api_base: token.api_uri(secure),
            token,
            http,
            uploader,
            stream_id,
        }
    }

    fn first_page_url(&self, begin: Time, end: Time) -> String {
        format!(
            "{}/api/v2/storage/data/?token={}&start={}&end={}",
            self.api_base,
            self.token.token,
            time::to_iso(begin),
            time::to_iso(end)
        )
    }

    async fn fetch_page(&self, url: &str) -> Option<StorageDataResponse> {
        let response = self
            .http
            .get(url)
            .timeout(LIST_TIMEOUT)
            .send()
            .await
            .map_err(|e| error!(error = %e, "storage list request failed"))
            .ok()?;
        if !response.status().is_success() {
            error!(status = %response.status(), "storage list rejected");
            return None;
        }
        response
            .json::<StorageDataResponse>()
            .await
            .map_err(|e| error!(error = %e, "storage list body unreadable"))
            .ok()
    }
}

impl TimelineSink for CloudStorage {
    async fn slices(&self, begin: Time, end: Time) -> Vec<Period> {
        let mut periods = Vec::new();
        let mut url = self.first_page_url(begin, end);

        loop {
            let Some(page) = self.fetch_page(&url).await else {
                break;
            };
            for object in page.objects {
                match (time::from_iso(&object.start), time::from_iso(&object.end)) {
                    (Some(b), Some(e)) if b < e => periods.push(Period::new(b, e)),
                    _ => warn!(start = %object.start, end = %object.end, "unparsable storage object"),
                }
            }
            match page.meta.next {
                Some(next) => url = format!("{}{}", self.api_base, next),
                None => break,
            }
        }

        period::squash(periods)
    }

    async fn store(&self, item: Item, canceled: CancelProbe) -> bool {
        if !item.is_valid() || item.data.is_empty() {
            error!(
                begin = %time::to_iso_packed(item.period.begin),
                end = %time::to_iso_packed(item.period.end),
                size = item.data.len(),
                "refusing to store bad item"
            );
            return false;
        }
        self.uploader
            .upload_record(item, &self.stream_id, canceled)
            .await
    }
}
