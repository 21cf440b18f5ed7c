//! Session credential for the Electra cloud.
//!
//! A session id is obtained by exchanging the long-lived token and the
//! phone identity (`imei`). The remote never announces expiry; a stale id
//! just makes calls come back with a non-zero status, so every call is
//! retried once with a renewed session.

use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::api::{AUTH_REQUEST_ID, Envelope, MobileApi, Request};
use crate::error::{Error, Result};

/// Platform descriptor sent with every token exchange.
const PLATFORM_OS: &str = "ios";
const PLATFORM_OS_VERSION: &str = "16.5";

#[derive(Debug, Clone)]
pub struct Credentials {
    pub token: SecretString,
    pub imei: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session(String);

impl Session {
    pub fn id(&self) -> &str {
        &self.0
    }
}

pub struct SessionManager {
    api: MobileApi,
    credentials: Credentials,
    /// Held across the exchange, so renewals are serialized.
    current: Mutex<Option<Session>>,
}

impl SessionManager {
    pub fn new(api: MobileApi, credentials: Credentials) -> Self {
        Self {
            api,
            credentials,
            current: Mutex::new(None),
        }
    }

    /// The cached session, renewing first if there is none yet.
    pub async fn session(&self) -> Result<Session> {
        let mut current = self.current.lock().await;
        if let Some(session) = current.as_ref() {
            return Ok(session.clone());
        }
        let fresh = self.exchange().await?;
        *current = Some(fresh.clone());
        Ok(fresh)
    }

    /// Always exchange the token for a new session and store it.
    pub async fn renew(&self) -> Result<Session> {
        let mut current = self.current.lock().await;
        let fresh = self.exchange().await?;
        *current = Some(fresh.clone());
        Ok(fresh)
    }

    /// Renew after `stale` was rejected, unless a concurrent caller has
    /// already replaced it.
    async fn renew_after_failure(&self, stale: &Session) -> Result<Session> {
        let mut current = self.current.lock().await;
        if let Some(session) = current.as_ref().filter(|s| *s != stale) {
            debug!("Session already renewed by another caller");
            return Ok(session.clone());
        }
        let fresh = self.exchange().await?;
        *current = Some(fresh.clone());
        Ok(fresh)
    }

    async fn exchange(&self) -> Result<Session> {
        let request = Request::new(AUTH_REQUEST_ID, "VALIDATE_TOKEN").with_data(json!({
            "imei": self.credentials.imei,
            "token": self.credentials.token.expose_secret(),
            "os": PLATFORM_OS,
            "osver": PLATFORM_OS_VERSION,
        }));
        let envelope = self.api.post(&request).await?;

        let sid = envelope
            .data
            .as_ref()
            .and_then(|d| d.get("sid"))
            .and_then(Value::as_str)
            .filter(|sid| !sid.is_empty())
            .ok_or_else(|| Error::Session {
                message: format!("VALIDATE_TOKEN returned status {} without a sid", envelope.status),
            })?;

        info!("Obtained new Electra session");
        Ok(Session(sid.to_string()))
    }

    /// Send a session-bound request. A non-zero status triggers one renewal
    /// and one retry; a second rejection is a gateway error.
    pub async fn call(&self, request: Request) -> Result<Envelope> {
        let cmd = request.cmd();
        let session = self.session().await?;
        let envelope = self.api.post(&request.clone().with_sid(session.id())).await?;
        if envelope.is_ok() {
            return Ok(envelope);
        }

        warn!(cmd, status = envelope.status, "Request rejected, renewing session and retrying");
        let session = self.renew_after_failure(&session).await?;
        let envelope = self.api.post(&request.with_sid(session.id())).await?;
        if envelope.is_ok() {
            Ok(envelope)
        } else {
            Err(Error::Gateway {
                cmd,
                status: envelope.status,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::electra::api::SESSION_REQUEST_ID;
    use wiremock::matchers::{body_partial_json, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn manager(server: &MockServer) -> SessionManager {
        SessionManager::new(
            MobileApi::new(&server.uri()).unwrap(),
            Credentials {
                token: SecretString::from("tok".to_string()),
                imei: "2b95000087654322".into(),
            },
        )
    }

    async fn mount_validate(server: &MockServer, sid: &str, times: u64) {
        Mock::given(method("POST"))
            .and(body_partial_json(json!({
                "id": 99,
                "cmd": "VALIDATE_TOKEN",
                "data": {"imei": "2b95000087654322", "token": "tok", "os": "ios"},
            })))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"status": 0, "data": {"sid": sid}})),
            )
            .up_to_n_times(times)
            .expect(times)
            .mount(server)
            .await;
    }

    async fn mount_devices(server: &MockServer, sid: &str, status: i64) {
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"cmd": "GET_DEVICES", "sid": sid})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"status": status, "data": {"devices": []}})),
            )
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn session_is_obtained_lazily_and_reused() {
        let server = MockServer::start().await;
        mount_validate(&server, "s1", 1).await;
        mount_devices(&server, "s1", 0).await;

        let sessions = manager(&server);
        for _ in 0..2 {
            let envelope = sessions
                .call(Request::new(SESSION_REQUEST_ID, "GET_DEVICES"))
                .await
                .unwrap();
            assert!(envelope.is_ok());
        }
        assert_eq!(sessions.session().await.unwrap().id(), "s1");
    }

    #[tokio::test]
    async fn rejected_call_renews_once_and_retries() {
        let server = MockServer::start().await;
        mount_validate(&server, "s1", 1).await;
        mount_validate(&server, "s2", 1).await;
        mount_devices(&server, "s1", 4).await;
        mount_devices(&server, "s2", 0).await;

        let sessions = manager(&server);
        let envelope = sessions
            .call(Request::new(SESSION_REQUEST_ID, "GET_DEVICES"))
            .await
            .unwrap();
        assert!(envelope.is_ok());
        assert_eq!(sessions.session().await.unwrap().id(), "s2");
    }

    #[tokio::test]
    async fn concurrent_rejections_share_one_renewal() {
        let server = MockServer::start().await;
        mount_validate(&server, "s1", 1).await;
        mount_validate(&server, "s2", 1).await;
        mount_devices(&server, "s1", 4).await;
        mount_devices(&server, "s2", 0).await;

        let sessions = manager(&server);
        let (a, b) = tokio::join!(
            sessions.call(Request::new(SESSION_REQUEST_ID, "GET_DEVICES")),
            sessions.call(Request::new(SESSION_REQUEST_ID, "GET_DEVICES")),
        );
        assert!(a.unwrap().is_ok());
        assert!(b.unwrap().is_ok());
        assert_eq!(sessions.session().await.unwrap().id(), "s2");
    }

    #[tokio::test]
    async fn second_rejection_is_a_gateway_error() {
        let server = MockServer::start().await;
        mount_validate(&server, "s1", 2).await;
        mount_devices(&server, "s1", 4).await;

        let err = manager(&server)
            .call(Request::new(SESSION_REQUEST_ID, "GET_DEVICES"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Gateway {
                cmd: "GET_DEVICES",
                status: 4
            }
        ));
    }

    #[tokio::test]
    async fn missing_sid_is_a_session_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": 1, "data": {}})))
            .mount(&server)
            .await;

        let err = manager(&server).renew().await.unwrap_err();
        assert!(matches!(err, Error::Session { .. }));
    }
}
