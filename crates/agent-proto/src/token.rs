//! Access token: base64-encoded JSON issued by the cloud, carrying the
//! registration token and the API/camera endpoint coordinates.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenProxy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socks5: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccessToken {
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub camid: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmngrid: Option<u64>,
    /// API host plus its plain / secure ports.
    pub api: String,
    pub api_p: u16,
    pub api_sp: u16,
    /// Camera control host plus its plain / secure ports.
    pub cam: String,
    pub cam_p: u16,
    pub cam_sp: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<TokenProxy>,
}

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

impl AccessToken {
    pub fn unpack(packed: &str) -> Result<Self, TokenError> {
        let raw = BASE64.decode(packed.trim())?;
        Ok(serde_json::from_slice(&raw)?)
    }

    pub fn pack(&self) -> String {
        // Serialization of a plain struct cannot fail.
        BASE64.encode(serde_json::to_vec(self).unwrap_or_default())
    }

    pub fn api_uri(&self, secure: bool) -> String {
        if secure {
            format!("https://{}:{}", self.api, self.api_sp)
        } else {
            format!("http://{}:{}", self.api, self.api_p)
        }
    }

    pub fn cam_uri(&self, secure: bool) -> String {
        if secure {
            format!("wss://{}:{}", self.cam, self.cam_sp)
        } else {
            format!("ws://{}:{}", self.cam, self.cam_p)
        }
    }

    pub fn socks5_proxy(&self) -> Option<&str> {
        self.proxy.as_ref().and_then(|p| p.socks5.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token() -> AccessToken {
        AccessToken {
            token: "reg-token".to_owned(),
            camid: Some(1234),
            cmngrid: Some(5),
            api: "api.example.com".to_owned(),
            api_p: 80,
            api_sp: 443,
            cam: "cam.example.com".to_owned(),
            cam_p: 8888,
            cam_sp: 8883,
            proxy: None,
        }
    }

    #[test]
    fn pack_unpack_round_trip() {
        let t = token();
        assert_eq!(AccessToken::unpack(&t.pack()).unwrap(), t);
    }

    #[test]
    fn uris_pick_port_by_scheme() {
        let t = token();
        assert_eq!(t.api_uri(true), "https://api.example.com:443");
        assert_eq!(t.api_uri(false), "http://api.example.com:80");
        assert_eq!(t.cam_uri(true), "wss://cam.example.com:8883");
    }

    #[test]
    fn unpack_rejects_garbage() {
        assert!(AccessToken::unpack("%%%not-base64%%%").is_err());
        let b64 = base64::engine::general_purpose::STANDARD.encode(b"{not json");
        assert!(AccessToken::unpack(&b64).is_err());
    }
}
