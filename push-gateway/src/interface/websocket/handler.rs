//! JSON 协议处理器
//!
//! 请求：`{"op": "subscribe", "args": ["orders"], "req_id": "1"}`
//!
//! V1 与 V2 只有应答信封不同：
//! - V1：`{"success": true, "ret_msg": "", "op": ..., "req_id": ..., "data": ...}`
//! - V2：`{"op": ..., "req_id": ..., "code": 0, "msg": "", "data": ...}`

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use push_gateway_core::{GatewayError, Result};

use crate::application::{ClientCommandService, CommandReply};
use crate::infrastructure::session::{FrameHandler, ProtocolVersion, Session};

#[derive(Debug, Deserialize)]
struct ClientRequest {
    op: String,
    #[serde(default)]
    args: Vec<Value>,
    #[serde(default)]
    req_id: Option<String>,
}

#[derive(Serialize)]
struct ReplyV1<'a> {
    success: bool,
    ret_msg: &'a str,
    op: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    req_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<&'a CommandReply>,
}

#[derive(Serialize)]
struct ReplyV2<'a> {
    op: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    req_id: Option<&'a str>,
    code: u32,
    msg: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<&'a CommandReply>,
}

pub struct JsonFrameHandler {
    commands: Arc<ClientCommandService>,
}

impl JsonFrameHandler {
    pub fn new(commands: Arc<ClientCommandService>) -> Self {
        Self { commands }
    }

    fn execute(&self, session: &Arc<Session>, request: &ClientRequest) -> Result<CommandReply> {
        match request.op.as_str() {
            "ping" => Ok(CommandReply {
                op: "pong",
                uid: None,
                topics: Vec::new(),
            }),
            "login" => {
                let token = str_arg(&request.args, 0, "token")?;
                self.commands.login(session, token)
            }
            "auth" => {
                let api_key = str_arg(&request.args, 0, "api_key")?;
                let expires = request
                    .args
                    .get(1)
                    .and_then(|v| v.as_i64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
                    .ok_or_else(|| GatewayError::InvalidArgument("missing expires".to_string()))?;
                let signature = str_arg(&request.args, 2, "signature")?;
                self.commands.auth(session, api_key, expires, signature)
            }
            "subscribe" => self.commands.subscribe(session, &topic_args(&request.args)?),
            "unsubscribe" => self
                .commands
                .unsubscribe(session, &topic_args(&request.args)?),
            "input" => {
                let topic = str_arg(&request.args, 0, "topic")?;
                let data = match request.args.get(1) {
                    Some(Value::String(s)) => Bytes::from(s.clone()),
                    Some(other) => Bytes::from(other.to_string()),
                    None => return Err(GatewayError::InvalidArgument("missing data".to_string())),
                };
                self.commands.input(session, topic, data)
            }
            other => Err(GatewayError::InvalidArgument(format!("unknown op {}", other))),
        }
    }
}

fn str_arg<'a>(args: &'a [Value], index: usize, name: &str) -> Result<&'a str> {
    args.get(index)
        .and_then(Value::as_str)
        .ok_or_else(|| GatewayError::InvalidArgument(format!("missing {}", name)))
}

fn topic_args(args: &[Value]) -> Result<Vec<String>> {
    args.iter()
        .map(|v| {
            v.as_str()
                .map(str::to_string)
                .ok_or_else(|| GatewayError::InvalidArgument("topic must be a string".to_string()))
        })
        .collect()
}

/// 按协议版本编码应答
pub fn encode_reply(
    version: ProtocolVersion,
    op: &str,
    req_id: Option<&str>,
    result: &Result<CommandReply>,
) -> Bytes {
    let (data, code, msg) = match result {
        Ok(reply) => (Some(reply), 0, String::new()),
        Err(e) => (None, e.code().as_u32(), e.to_string()),
    };
    let encoded = match version {
        ProtocolVersion::V1 => serde_json::to_vec(&ReplyV1 {
            success: code == 0,
            ret_msg: &msg,
            op,
            req_id,
            data,
        }),
        ProtocolVersion::V2 => serde_json::to_vec(&ReplyV2 {
            op,
            req_id,
            code,
            msg: &msg,
            data,
        }),
    };
    Bytes::from(encoded.unwrap_or_default())
}

#[async_trait]
impl FrameHandler for JsonFrameHandler {
    async fn handle(&self, session: &Arc<Session>, frame: Bytes) -> Result<()> {
        let (op, req_id, result) = match serde_json::from_slice::<ClientRequest>(&frame) {
            Ok(request) => {
                let result = self.execute(session, &request);
                (request.op, request.req_id, result)
            }
            Err(e) => (
                String::new(),
                None,
                Err(GatewayError::InvalidArgument(format!("malformed request: {}", e))),
            ),
        };
        if let Err(e) = &result {
            debug!(session_id = %session.id(), op = %op, error = %e, "client command failed");
        }
        // 应答写失败说明连接已不可用
        session
            .write_reply(encode_reply(session.version(), &op, req_id.as_deref(), &result))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::Exchange;
    use crate::config::GatewayConfig;
    use crate::infrastructure::acceptor::AcceptorMgr;
    use crate::infrastructure::auth::GatewayAuthenticator;
    use crate::infrastructure::public::PublicMgr;
    use crate::infrastructure::session::{AdmissionPolicy, ConnMeta, SessionMgr, SessionOptions};
    use crate::infrastructure::user::UserMgr;
    use push_gateway_core::{GatewayMetrics, current_millis};

    fn handler() -> (JsonFrameHandler, Arc<GatewayMetrics>) {
        let metrics = Arc::new(GatewayMetrics::new());
        let config = Arc::new(GatewayConfig {
            exchange_async: false,
            ..GatewayConfig::default()
        });
        let exchange = Exchange::new(
            Arc::clone(&config),
            Arc::new(UserMgr::new(0, Default::default(), Arc::clone(&metrics))),
            Arc::new(AcceptorMgr::new(Arc::clone(&metrics))),
            Arc::new(PublicMgr::from_config(&config, Arc::clone(&metrics))),
            Arc::new(SessionMgr::new(
                AdmissionPolicy::from_config(&config),
                Arc::clone(&metrics),
            )),
            Arc::clone(&metrics),
        );
        let auth = GatewayAuthenticator::new(None).with_api_key("k1", "s1", 42);
        let commands = ClientCommandService::new(&config, exchange, Arc::new(auth));
        (JsonFrameHandler::new(Arc::new(commands)), metrics)
    }

    fn session(path: &str, metrics: &Arc<GatewayMetrics>) -> Arc<Session> {
        let meta = ConnMeta {
            path: path.to_string(),
            ..ConnMeta::with_ip("127.0.0.1")
        };
        Session::new(meta, SessionOptions::default(), Arc::clone(metrics))
    }

    fn reply(session: &Arc<Session>) -> Value {
        let frames = session.drain_queued();
        assert_eq!(frames.len(), 1);
        serde_json::from_slice(&frames[0]).unwrap()
    }

    #[tokio::test]
    async fn test_v1_auth_and_subscribe() {
        let (h, metrics) = handler();
        let s = session("/v1/private", &metrics);

        let expires = current_millis() + 60_000;
        let sig = GatewayAuthenticator::sign("s1", expires).unwrap();
        let req = serde_json::json!({"op": "auth", "args": ["k1", expires, sig], "req_id": "a1"});
        h.handle(&s, Bytes::from(req.to_string())).await.unwrap();
        let v = reply(&s);
        assert_eq!(v["success"], true);
        assert_eq!(v["req_id"], "a1");
        assert_eq!(v["data"]["uid"], 42);

        let req = r#"{"op":"subscribe","args":["orders","orders"]}"#;
        h.handle(&s, Bytes::from_static(req.as_bytes())).await.unwrap();
        let v = reply(&s);
        assert_eq!(v["data"]["topics"], serde_json::json!(["orders"]));
    }

    #[tokio::test]
    async fn test_v2_error_envelope() {
        let (h, metrics) = handler();
        let s = session("/v2/private", &metrics);

        h.handle(&s, Bytes::from_static(br#"{"op":"subscribe","args":["orders"]}"#))
            .await
            .unwrap();
        let v = reply(&s);
        assert_eq!(v["code"], GatewayError::NotAuthenticated.code().as_u32());
        assert!(v.get("success").is_none());

        h.handle(&s, Bytes::from_static(b"not json")).await.unwrap();
        let v = reply(&s);
        assert_eq!(v["code"], GatewayError::InvalidArgument(String::new()).code().as_u32());

        h.handle(&s, Bytes::from_static(br#"{"op":"ping","req_id":"p"}"#))
            .await
            .unwrap();
        let v = reply(&s);
        assert_eq!(v["data"]["op"], "pong");
        assert_eq!(v["code"], 0);
    }
}
