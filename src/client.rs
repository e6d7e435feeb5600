#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

use std::fmt;
use std::fs::read_to_string;
use std::path::Path;
use std::time::Duration;

use async_std::future::timeout;
use async_trait::async_trait;
use chrono::{Local, SecondsFormat, Utc};
use futures::future::FutureExt;
use gethostname::gethostname;
use serde::{Deserialize, Serialize};
use zeromq::prelude::*;
use zeromq::{ReqSocket, ZmqError, ZmqMessage};

/// Service name stamped into the sender block of every request.
const SERVICE_NAME: &str = "orpheus-daq";

#[derive(Debug)]
pub enum ClientError {
    Socket(ZmqError),        // transport-level failure
    Timeout { endpoint: String }, // no reply before the configured deadline
    Wire(serde_json::Error), // request failed to encode or reply to decode
    ErrorReply { retcode: i64, message: String }, // broker answered with retcode != 0
    BadReply { endpoint: String, expected: &'static str }, // reply payload missing or mistyped
    CredentialsFile(String), // auths file unreadable or malformed
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::Socket(e) => write!(f, "zeromq socket failure [{}]", e),
            ClientError::Timeout { endpoint } => {
                write!(f, "no reply from broker for endpoint '{}'", endpoint)
            }
            ClientError::Wire(e) => write!(f, "malformed message [{}]", e),
            ClientError::ErrorReply { retcode, message } => {
                write!(f, "broker returned error code {}: {}", retcode, message)
            }
            ClientError::BadReply { endpoint, expected } => {
                write!(f, "reply for '{}' did not carry {}", endpoint, expected)
            }
            ClientError::CredentialsFile(msg) => write!(f, "could not load credentials [{}]", msg),
        }
    }
}

impl From<ZmqError> for ClientError {
    fn from(e: ZmqError) -> Self {
        Self::Socket(e)
    }
}
impl From<serde_json::Error> for ClientError {
    fn from(e: serde_json::Error) -> Self {
        Self::Wire(e)
    }
}

/// Broker login, read from a JSON authentications file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    /// Reads credentials from a file of the shape
    /// `{"username": ..., "password": ...}`.
    ///
    /// # Errors
    /// The file must exist, be readable, and parse as the expected JSON.
    pub fn from_file(path: &Path) -> Result<Self, ClientError> {
        let text = read_to_string(path)
            .map_err(|e| ClientError::CredentialsFile(format!("{}: {}", path.display(), e)))?;
        serde_json::from_str(&text)
            .map_err(|e| ClientError::CredentialsFile(format!("{}: {}", path.display(), e)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MsgOp {
    Get,
    Set,
    Cmd,
}

#[derive(Debug, Clone, Serialize)]
pub struct SenderInfo {
    pub hostname: String,
    pub service: String,
    pub username: String,
}

/// One request envelope as it goes over the wire.
#[derive(Debug, Serialize)]
pub struct Request<'a> {
    pub msgop: MsgOp,
    pub endpoint: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    pub timestamp: String,
    pub message_id: String,
    pub sender: &'a SenderInfo,
    pub auth: &'a Credentials,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReplyPayload {
    #[serde(default)]
    pub value_raw: Option<serde_json::Value>,
    #[serde(default)]
    pub value_cal: Option<serde_json::Value>,
}

/// A broker reply. `retcode` zero means success; the payload carries the
/// endpoint's raw and/or calibrated value.
#[derive(Debug, Clone, Deserialize)]
pub struct Reply {
    pub retcode: i64,
    #[serde(default)]
    pub return_msg: String,
    #[serde(default)]
    pub payload: ReplyPayload,
}

impl Reply {
    /// The payload's `value_raw` as a string.
    ///
    /// # Errors
    /// The payload must carry a string-typed `value_raw`.
    pub fn require_raw_str(&self, endpoint: &str) -> Result<&str, ClientError> {
        self.payload
            .value_raw
            .as_ref()
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| ClientError::BadReply {
                endpoint: endpoint.to_string(),
                expected: "a string in value_raw",
            })
    }

    /// The payload's `value_cal` as a numeric array.
    ///
    /// # Errors
    /// The payload must carry an all-numeric array in `value_cal`.
    pub fn require_cal_f64s(&self, endpoint: &str) -> Result<Vec<f64>, ClientError> {
        let values = self
            .payload
            .value_cal
            .as_ref()
            .and_then(serde_json::Value::as_array)
            .ok_or_else(|| ClientError::BadReply {
                endpoint: endpoint.to_string(),
                expected: "an array in value_cal",
            })?;
        values
            .iter()
            .map(serde_json::Value::as_f64)
            .collect::<Option<Vec<f64>>>()
            .ok_or_else(|| ClientError::BadReply {
                endpoint: endpoint.to_string(),
                expected: "numeric entries in value_cal",
            })
    }
}

/// The three operations the broker understands, as a seam so sequencing code
/// can run against a scripted stand-in under test.
#[async_trait]
pub trait CommandClient {
    /// Read an endpoint's current value.
    ///
    /// # Errors
    /// Propagates transport, encoding, and broker-side failures.
    async fn get(&mut self, endpoint: &str) -> Result<Reply, ClientError>;

    /// Assign a new value to an endpoint.
    ///
    /// # Errors
    /// Propagates transport, encoding, and broker-side failures.
    async fn set(&mut self, endpoint: &str, value: serde_json::Value)
        -> Result<Reply, ClientError>;

    /// Invoke a named command on an endpoint.
    ///
    /// # Errors
    /// Propagates transport, encoding, and broker-side failures.
    async fn cmd(&mut self, endpoint: &str, action: &str) -> Result<Reply, ClientError>;
}

/// REQ-socket client speaking JSON request envelopes to the instrument
/// broker. Built once at startup and passed by `&mut` into everything that
/// talks to hardware.
pub struct BrokerClient {
    broker: String,
    sock: ReqSocket,
    credentials: Credentials,
    sender: SenderInfo,
    reply_timeout: Duration,
}

impl BrokerClient {
    /// Loads credentials and connects to the broker's REQ/REP endpoint.
    ///
    /// # Errors
    /// Fails if the credentials file is unusable or the socket cannot
    /// connect.
    pub async fn connect(
        broker: &str,
        auths_file: &Path,
        reply_timeout: Duration,
    ) -> Result<Self, ClientError> {
        let credentials = Credentials::from_file(auths_file)?;
        let sender = SenderInfo {
            hostname: gethostname()
                .into_string()
                .unwrap_or_else(|_| String::from("unknown-host")),
            service: SERVICE_NAME.to_string(),
            username: credentials.username.clone(),
        };
        let mut sock = ReqSocket::new();
        sock.connect(broker).await?;
        println!("[{}] connected to broker at {}", Local::now(), broker);
        Ok(BrokerClient {
            broker: broker.to_string(),
            sock,
            credentials,
            sender,
            reply_timeout,
        })
    }

    #[inline]
    #[must_use]
    pub fn broker(&self) -> &str {
        &self.broker
    }

    #[inline]
    #[must_use]
    pub fn reply_timeout(&self) -> Duration {
        self.reply_timeout
    }

    fn envelope<'a>(
        &'a self,
        msgop: MsgOp,
        endpoint: &'a str,
        value: Option<serde_json::Value>,
    ) -> Request<'a> {
        Request {
            msgop,
            endpoint,
            value,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            message_id: format!("{:032x}", rand::random::<u128>()),
            sender: &self.sender,
            auth: &self.credentials,
        }
    }

    async fn transact(
        &mut self,
        msgop: MsgOp,
        endpoint: &str,
        value: Option<serde_json::Value>,
    ) -> Result<Reply, ClientError> {
        let body = serde_json::to_string(&self.envelope(msgop, endpoint, value))?;
        self.sock.send(ZmqMessage::from(body)).await?;

        let msg = match timeout(self.reply_timeout, self.sock.recv()).await {
            Ok(received) => received?,
            Err(_) => {
                self.recover().await;
                return Err(ClientError::Timeout {
                    endpoint: endpoint.to_string(),
                });
            }
        };
        let frame = msg.get(0).ok_or_else(|| ClientError::BadReply {
            endpoint: endpoint.to_string(),
            expected: "a reply frame",
        })?;
        let reply: Reply = serde_json::from_slice(frame)?;
        if reply.retcode != 0 {
            return Err(ClientError::ErrorReply {
                retcode: reply.retcode,
                message: reply.return_msg,
            });
        }
        Ok(reply)
    }

    // A REQ socket abandoned mid-exchange refuses further sends. Scavenge a
    // late reply if one is already queued, otherwise swap in a fresh socket.
    async fn recover(&mut self) {
        if let Some(Ok(_late)) = self.sock.recv().now_or_never() {
            return;
        }
        let mut fresh = ReqSocket::new();
        match fresh.connect(&self.broker).await {
            Ok(()) => self.sock = fresh,
            Err(e) => eprintln!(
                "[{}] failed to reconnect to broker at {}: [{}]",
                Local::now(),
                self.broker,
                e
            ),
        }
    }
}

#[async_trait]
impl CommandClient for BrokerClient {
    async fn get(&mut self, endpoint: &str) -> Result<Reply, ClientError> {
        self.transact(MsgOp::Get, endpoint, None).await
    }

    async fn set(
        &mut self,
        endpoint: &str,
        value: serde_json::Value,
    ) -> Result<Reply, ClientError> {
        self.transact(MsgOp::Set, endpoint, Some(value)).await
    }

    async fn cmd(&mut self, endpoint: &str, action: &str) -> Result<Reply, ClientError> {
        self.transact(
            MsgOp::Cmd,
            endpoint,
            Some(serde_json::Value::String(action.to_string())),
        )
        .await
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{Call, ScriptedClient};
    use super::*;
    use serde_json::json;

    fn demo_auth() -> (SenderInfo, Credentials) {
        let auth = Credentials {
            username: "orpheus".to_string(),
            password: "hush".to_string(),
        };
        let sender = SenderInfo {
            hostname: "daq-host".to_string(),
            service: SERVICE_NAME.to_string(),
            username: auth.username.clone(),
        };
        (sender, auth)
    }

    #[test]
    fn request_wire_shape() {
        let (sender, auth) = demo_auth();
        let req = Request {
            msgop: MsgOp::Set,
            endpoint: "na_start_freq",
            value: Some(json!(15.0e9)),
            timestamp: "2023-01-01T00:00:00.000000Z".to_string(),
            message_id: "00".repeat(16),
            sender: &sender,
            auth: &auth,
        };
        let text = serde_json::to_string(&req).expect("request should serialize");
        let wire: serde_json::Value = serde_json::from_str(&text).expect("should parse back");
        assert_eq!(wire["msgop"], "set");
        assert_eq!(wire["endpoint"], "na_start_freq");
        assert_eq!(wire["value"], json!(15.0e9));
        assert_eq!(wire["sender"]["service"], "orpheus-daq");
        assert_eq!(wire["auth"]["username"], "orpheus");
        assert_eq!(wire["auth"]["password"], "hush");
    }

    #[test]
    fn get_requests_omit_the_value_field() {
        let (sender, auth) = demo_auth();
        let req = Request {
            msgop: MsgOp::Get,
            endpoint: "curved_mirror_motor_request_status",
            value: None,
            timestamp: String::new(),
            message_id: String::new(),
            sender: &sender,
            auth: &auth,
        };
        let text = serde_json::to_string(&req).expect("request should serialize");
        let wire: serde_json::Value = serde_json::from_str(&text).expect("should parse back");
        assert_eq!(wire["msgop"], "get");
        assert!(wire.get("value").is_none());
    }

    #[test]
    fn reply_payload_extraction() {
        let reply: Reply = serde_json::from_str(
            r#"{"retcode": 0, "return_msg": "", "payload": {"value_raw": "R"}}"#,
        )
        .expect("reply should parse");
        assert_eq!(
            reply.require_raw_str("x_motor_request_status").expect("value_raw"),
            "R"
        );
        assert!(matches!(
            reply.require_cal_f64s("x"),
            Err(ClientError::BadReply { .. })
        ));

        let reply: Reply = serde_json::from_str(
            r#"{"retcode": 0, "payload": {"value_cal": [1.0, -2.5, 3.0]}}"#,
        )
        .expect("reply should parse");
        assert_eq!(
            reply.require_cal_f64s("s21_iq_transmission_data").expect("value_cal"),
            vec![1.0, -2.5, 3.0]
        );

        let bare: Reply =
            serde_json::from_str(r#"{"retcode": 0}"#).expect("minimal reply should parse");
        assert!(bare.payload.value_raw.is_none());
    }

    #[test]
    fn scripted_replies_answer_reads_not_commands() {
        async_std::task::block_on(async {
            let mut client = ScriptedClient::new();
            client.stage_cal("s21_iq_transmission_data", json!([1.0, 0.0, 2.0, 0.0]));

            // an archiving command on the endpoint must leave the staged
            // trace for the read that follows it
            client
                .cmd("s21_iq_transmission_data", "scheduled_log")
                .await
                .expect("scripted cmd");
            client
                .set("s21_iq_transmission_data", json!(0))
                .await
                .expect("scripted set");
            let reply = client
                .get("s21_iq_transmission_data")
                .await
                .expect("scripted get");
            assert_eq!(
                reply
                    .require_cal_f64s("s21_iq_transmission_data")
                    .expect("staged trace"),
                vec![1.0, 0.0, 2.0, 0.0]
            );
            assert_eq!(
                client.calls,
                vec![
                    Call::Cmd(
                        "s21_iq_transmission_data".to_string(),
                        "scheduled_log".to_string()
                    ),
                    Call::Set("s21_iq_transmission_data".to_string(), json!(0)),
                    Call::Get("s21_iq_transmission_data".to_string()),
                ]
            );
        });
    }

    #[test]
    fn broker_round_trip() {
        async_std::task::block_on(async {
            let mut rep = zeromq::RepSocket::new();
            let endpoint = rep
                .bind("tcp://127.0.0.1:0")
                .await
                .expect("should bind a loopback port")
                .to_string();

            let auths_path = std::env::temp_dir()
                .join(format!("orpheus-daq-test-auths-{}.json", std::process::id()));
            std::fs::write(&auths_path, r#"{"username": "orpheus", "password": "hush"}"#)
                .expect("should write auths file");

            let responder = async_std::task::spawn(async move {
                let msg = rep.recv().await.expect("should receive a request");
                let text =
                    std::str::from_utf8(msg.get(0).expect("one frame")).expect("utf8 request");
                let request: serde_json::Value =
                    serde_json::from_str(text).expect("request should be json");
                assert_eq!(request["msgop"], "get");
                assert_eq!(request["endpoint"], "curved_mirror_motor_request_status");
                assert_eq!(request["auth"]["username"], "orpheus");
                rep.send(ZmqMessage::from(
                    r#"{"retcode": 0, "return_msg": "", "payload": {"value_raw": "R"}}"#
                        .to_string(),
                ))
                .await
                .expect("should send the reply");

                let _again = rep.recv().await.expect("should receive a second request");
                rep.send(ZmqMessage::from(
                    r#"{"retcode": 102, "return_msg": "endpoint not found", "payload": {}}"#
                        .to_string(),
                ))
                .await
                .expect("should send the error reply");
            });

            let mut client =
                BrokerClient::connect(&endpoint, &auths_path, Duration::from_secs(5))
                    .await
                    .expect("should connect");
            let reply = client
                .get("curved_mirror_motor_request_status")
                .await
                .expect("should get a reply");
            assert_eq!(
                reply
                    .require_raw_str("curved_mirror_motor_request_status")
                    .expect("value_raw"),
                "R"
            );

            let err = client.get("no_such_endpoint").await;
            assert!(matches!(
                err,
                Err(ClientError::ErrorReply { retcode: 102, .. })
            ));

            responder.await;
            let _ = std::fs::remove_file(&auths_path);
        });
    }
}
