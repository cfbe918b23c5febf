//! Agent configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides.
//! Default config path: `/etc/cloud-agent/agent.toml`.
//!
//! # Required fields
//! - `schema_version = 1`
//! - `auth.token_file`
//!
//! # Token file format
//! Base64-encoded JSON access token on a single line; trimmed on read.

use agent_proto::AccessToken;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

/// Top-level agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub schema_version: u32,
    /// Unpacked access token (read from the token file, not the file path).
    pub access_token: AccessToken,
    pub device: DeviceConfig,
    pub cloud: CloudConfig,
    pub sync: SyncTuning,
    pub uploads: UploadTuning,
    pub events: EventTuning,
}

#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub vendor: String,
    pub brand: String,
    pub model: String,
    pub serial: String,
    pub fw_version: String,
    pub device_type: String,
    pub ip: String,
    pub agent_version: String,
    pub timezone: String,
}

#[derive(Debug, Clone)]
pub struct CloudConfig {
    /// Use http/rtmp instead of https/rtmps.
    pub insecure_cloud_channel: bool,
    pub allow_invalid_ssl_certs: bool,
}

#[derive(Debug, Clone)]
pub struct SyncTuning {
    /// Sync chunk size.
    pub record_by_event_upload_step: Duration,
    /// Initial delay for event-triggered syncs, lets neighbouring events
    /// merge into one remote range.
    pub delay_between_event_and_records_upload_start: Duration,
    pub pre_record_time: Duration,
    pub post_record_time: Duration,
}

#[derive(Debug, Clone)]
pub struct UploadTuning {
    pub max_concurrent_video_uploads: usize,
    pub max_concurrent_snapshot_uploads: usize,
    pub max_concurrent_file_meta_uploads: usize,
    /// Bytes/s ceiling per HTTP PUT; 0 = unlimited.
    pub max_upload_speed: u64,
    /// Planned uploads older than this are dropped before the URL request.
    pub max_video_uploads_queue_lateness: Duration,
}

#[derive(Debug, Clone)]
pub struct EventTuning {
    pub send_qos_report_as_separate_event: bool,
    pub send_qos_report_period: Duration,
    /// Attach snapshots to state-emulation continuation dummies.
    pub stateful_event_continuation_kick_snapshot: bool,
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    auth: Option<RawAuthConfig>,
    device: Option<RawDeviceConfig>,
    cloud: Option<RawCloudConfig>,
    sync: Option<RawSyncConfig>,
    uploads: Option<RawUploadsConfig>,
    events: Option<RawEventsConfig>,
}

#[derive(Debug, Deserialize)]
struct RawAuthConfig {
    token_file: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RawDeviceConfig {
    vendor: Option<String>,
    brand: Option<String>,
    model: Option<String>,
    serial: Option<String>,
    fw_version: Option<String>,
    device_type: Option<String>,
    ip: Option<String>,
    timezone: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RawCloudConfig {
    insecure_cloud_channel: Option<bool>,
    allow_invalid_ssl_certs: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct RawSyncConfig {
    record_by_event_upload_step: Option<u64>,
    delay_between_event_and_records_upload_start: Option<u64>,
    default_pre_record_time: Option<u64>,
    default_post_record_time: Option<u64>,
    max_pre_record_time: Option<u64>,
    max_post_record_time: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct RawUploadsConfig {
    max_concurrent_video_uploads: Option<usize>,
    max_concurrent_snapshot_uploads: Option<usize>,
    max_concurrent_file_meta_uploads: Option<usize>,
    max_upload_speed: Option<u64>,
    max_video_uploads_queue_lateness_minutes: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct RawEventsConfig {
    send_qos_report_as_separate_event: Option<bool>,
    send_qos_report_period_sec: Option<u64>,
    stateful_event_continuation_kick_snapshot: Option<bool>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load agent config from a custom path.
pub fn load_config_from_path(path: &Path) -> Result<AgentConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

/// Load agent config from the default path `/etc/cloud-agent/agent.toml`.
pub fn load_config() -> Result<AgentConfig, ConfigError> {
    load_config_from_path(Path::new("/etc/cloud-agent/agent.toml"))
}

/// Load agent config from a TOML string.
pub fn load_config_from_str(toml_str: &str) -> Result<AgentConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let schema_version = raw
        .schema_version
        .ok_or_else(|| ConfigError::MissingField("schema_version".to_owned()))?;
    if schema_version != 1 {
        return Err(ConfigError::InvalidValue(format!(
            "schema_version must be 1, got {schema_version}"
        )));
    }

    let raw_auth = raw
        .auth
        .ok_or_else(|| ConfigError::MissingField("auth".to_owned()))?;
    let token_file = raw_auth
        .token_file
        .ok_or_else(|| ConfigError::MissingField("auth.token_file".to_owned()))?;
    let access_token = read_token_file(&token_file)?;

    let d = raw.device.unwrap_or_default();
    let device = DeviceConfig {
        vendor: d.vendor.unwrap_or_else(|| "noname".to_owned()),
        brand: d.brand.unwrap_or_else(|| "nobrand".to_owned()),
        model: d.model.unwrap_or_else(|| "nomodel".to_owned()),
        serial: d.serial.unwrap_or_else(|| "noserial".to_owned()),
        fw_version: d.fw_version.unwrap_or_else(|| "noversion".to_owned()),
        device_type: d.device_type.unwrap_or_else(|| "notype".to_owned()),
        ip: d.ip.unwrap_or_else(|| "127.0.0.1".to_owned()),
        agent_version: env!("CARGO_PKG_VERSION").to_owned(),
        timezone: d.timezone.unwrap_or_else(|| "UTC".to_owned()),
    };

    let c = raw.cloud.unwrap_or_default();
    let cloud = CloudConfig {
        insecure_cloud_channel: c.insecure_cloud_channel.unwrap_or(false),
        allow_invalid_ssl_certs: c.allow_invalid_ssl_certs.unwrap_or(false),
    };

    let s = raw.sync.unwrap_or_default();
    let max_pre = Duration::from_secs(s.max_pre_record_time.unwrap_or(20));
    let max_post = Duration::from_secs(s.max_post_record_time.unwrap_or(20));
    let sync = SyncTuning {
        record_by_event_upload_step: Duration::from_secs(
            s.record_by_event_upload_step.unwrap_or(15),
        ),
        delay_between_event_and_records_upload_start: Duration::from_secs(
            s.delay_between_event_and_records_upload_start.unwrap_or(60),
        ),
        // Padding is capped by the configured maxima.
        pre_record_time: Duration::from_secs(s.default_pre_record_time.unwrap_or(10)).min(max_pre),
        post_record_time: Duration::from_secs(s.default_post_record_time.unwrap_or(10))
            .min(max_post),
    };

    let u = raw.uploads.unwrap_or_default();
    let uploads = UploadTuning {
        max_concurrent_video_uploads: u.max_concurrent_video_uploads.unwrap_or(2).max(1),
        max_concurrent_snapshot_uploads: u.max_concurrent_snapshot_uploads.unwrap_or(4).max(1),
        max_concurrent_file_meta_uploads: u.max_concurrent_file_meta_uploads.unwrap_or(6).max(1),
        max_upload_speed: u.max_upload_speed.unwrap_or(0),
        max_video_uploads_queue_lateness: Duration::from_secs(
            60 * u.max_video_uploads_queue_lateness_minutes.unwrap_or(30),
        ),
    };

    let e = raw.events.unwrap_or_default();
    let events = EventTuning {
        send_qos_report_as_separate_event: e.send_qos_report_as_separate_event.unwrap_or(false),
        send_qos_report_period: Duration::from_secs(e.send_qos_report_period_sec.unwrap_or(600)),
        stateful_event_continuation_kick_snapshot: e
            .stateful_event_continuation_kick_snapshot
            .unwrap_or(true),
    };

    Ok(AgentConfig {
        schema_version,
        access_token,
        device,
        cloud,
        sync,
        uploads,
        events,
    })
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Missing required field: {0}")]
    MissingField(String),
    #[error("Invalid config value: {0}")]
    InvalidValue(String),
    #[error("Bad access token: {0}")]
    Token(#[from] agent_proto::token::TokenError),
}

// ---------------------------------------------------------------------------
// Token file reader
// ---------------------------------------------------------------------------

fn read_token_file(path: &str) -> Result<AccessToken, ConfigError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading token file '{path}': {e}")))?;
    Ok(AccessToken::unpack(content.trim())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn token_file() -> tempfile::NamedTempFile {
        let token = AccessToken {
            token: "reg".to_owned(),
            camid: Some(7),
            cmngrid: None,
            api: "api.example.com".to_owned(),
            api_p: 80,
            api_sp: 443,
            cam: "cam.example.com".to_owned(),
            cam_p: 8888,
            cam_sp: 8883,
            proxy: None,
        };
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{}", token.pack()).unwrap();
        file
    }

    fn minimal_toml(token_path: &str) -> String {
        format!("schema_version = 1\n[auth]\ntoken_file = \"{token_path}\"\n")
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let tf = token_file();
        let cfg = load_config_from_str(&minimal_toml(&tf.path().display().to_string())).unwrap();

        assert_eq!(cfg.access_token.camid, Some(7));
        assert_eq!(cfg.sync.record_by_event_upload_step, Duration::from_secs(15));
        assert_eq!(cfg.uploads.max_concurrent_video_uploads, 2);
        assert_eq!(cfg.sync.pre_record_time, Duration::from_secs(10));
        assert!(cfg.events.stateful_event_continuation_kick_snapshot);
    }

    #[test]
    fn pre_post_record_times_are_clamped_to_maxima() {
        let tf = token_file();
        let toml = format!(
            "{}[sync]\ndefault_pre_record_time = 90\ndefault_post_record_time = 5\nmax_pre_record_time = 20\n",
            minimal_toml(&tf.path().display().to_string())
        );
        let cfg = load_config_from_str(&toml).unwrap();
        assert_eq!(cfg.sync.pre_record_time, Duration::from_secs(20));
        assert_eq!(cfg.sync.post_record_time, Duration::from_secs(5));
    }

    #[test]
    fn missing_schema_version_is_rejected() {
        let err = load_config_from_str("[auth]\ntoken_file = \"/nope\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::MissingField(f) if f == "schema_version"));
    }

    #[test]
    fn wrong_schema_version_is_rejected() {
        let err = load_config_from_str("schema_version = 2\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(_)));
    }

    #[test]
    fn unreadable_token_file_is_an_io_error() {
        let err =
            load_config_from_str("schema_version = 1\n[auth]\ntoken_file = \"/does/not/exist\"\n")
                .unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
