//! `mobile/mobilecommand` transport: request framing and the status envelope.
//!
//! Every call to the Electra cloud goes through one endpoint. The command
//! name travels in the body, and success is `status == 0` in the response
//! envelope regardless of the HTTP status line.

use std::time::Duration;

use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};

pub const DEFAULT_BASE_URL: &str = "https://app.ecpiot.co.il/";

const USER_AGENT: &str = "Electra Client";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Request id used for session-less calls (token validation).
pub const AUTH_REQUEST_ID: u32 = 99;
/// Request id used for every session-bound call.
pub const SESSION_REQUEST_ID: u32 = 1000;

#[derive(Debug, Clone, Serialize)]
pub struct Request {
    pvdid: u32,
    id: u32,
    cmd: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sid: Option<String>,
}

impl Request {
    pub fn new(id: u32, cmd: &'static str) -> Self {
        Self {
            pvdid: 1,
            id,
            cmd,
            data: None,
            sid: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_sid(mut self, sid: &str) -> Self {
        self.sid = Some(sid.to_string());
        self
    }

    pub fn cmd(&self) -> &'static str {
        self.cmd
    }
}

#[derive(Debug, Deserialize)]
pub struct Envelope {
    pub status: i64,
    #[serde(default)]
    pub data: Option<Value>,
}

impl Envelope {
    pub fn is_ok(&self) -> bool {
        self.status == 0
    }
}

#[derive(Debug, Clone)]
pub struct MobileApi {
    http: reqwest::Client,
    endpoint: Url,
}

impl MobileApi {
    pub fn new(base_url: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Self::with_client(base_url, http)
    }

    pub fn with_client(base_url: &str, http: reqwest::Client) -> Result<Self> {
        let mut base = base_url.to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let endpoint = Url::parse(&base)
            .and_then(|u| u.join("mobile/mobilecommand"))
            .map_err(|e| Error::validation(format!("invalid base URL {base_url}: {e}")))?;
        Ok(Self { http, endpoint })
    }

    /// POST one command and decode the envelope. Status is left to the caller.
    pub async fn post(&self, request: &Request) -> Result<Envelope> {
        debug!(cmd = request.cmd, "POST {}", self.endpoint);

        let body = self
            .http
            .post(self.endpoint.clone())
            .json(request)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        serde_json::from_str(&body)
            .map_err(|e| Error::malformed(format!("{} envelope: {e}", request.cmd)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn request_omits_absent_fields() {
        let req = Request::new(SESSION_REQUEST_ID, "GET_DEVICES");
        assert_eq!(
            serde_json::to_value(&req).unwrap(),
            json!({"pvdid": 1, "id": 1000, "cmd": "GET_DEVICES"})
        );

        let req = req.with_sid("abc").with_data(json!({"id": 7}));
        assert_eq!(
            serde_json::to_value(&req).unwrap(),
            json!({"pvdid": 1, "id": 1000, "cmd": "GET_DEVICES", "data": {"id": 7}, "sid": "abc"})
        );
    }

    #[tokio::test]
    async fn posts_to_mobilecommand_with_client_user_agent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/mobile/mobilecommand"))
            .and(header("user-agent", USER_AGENT))
            .and(body_partial_json(json!({"cmd": "GET_DEVICES"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": 3, "data": null})))
            .expect(1)
            .mount(&server)
            .await;

        let api = MobileApi::new(&server.uri()).unwrap();
        let envelope = api
            .post(&Request::new(SESSION_REQUEST_ID, "GET_DEVICES"))
            .await
            .unwrap();

        assert_eq!(envelope.status, 3);
        assert!(!envelope.is_ok());
        assert!(envelope.data.is_none());
    }

    #[tokio::test]
    async fn garbage_body_is_a_deserialization_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let api = MobileApi::new(&server.uri()).unwrap();
        let err = api
            .post(&Request::new(SESSION_REQUEST_ID, "GET_DEVICES"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Deserialization { .. }));
    }

    #[test]
    fn rejects_unparseable_base_url() {
        assert!(matches!(
            MobileApi::new("not a url"),
            Err(Error::Validation { .. })
        ));
    }
}
