//! Mailbox 线协议定义
//!
//! 每帧一行 JSON（LinesCodec 分帧），客户端发送 Request，服务端只对 get 回复 Response

use serde::{Deserialize, Serialize};

/// 客户端 → 服务端
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// 追加一条消息，不等待回复
    Put { topic: String, message: String },

    /// 取出本连接在该 topic 上最旧的未读消息
    Get { topic: String },

    /// 管理命令：停止服务
    Shutdown,
}

/// 服务端 → 客户端
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    /// get 的结果；空字符串表示当前没有新消息
    Message { topic: String, message: String },
}

impl Request {
    pub fn put(topic: &str, message: impl Into<String>) -> Self {
        Request::Put {
            topic: topic.to_string(),
            message: message.into(),
        }
    }

    pub fn get(topic: &str) -> Self {
        Request::Get {
            topic: topic.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_format() {
        let json = serde_json::to_string(&Request::put("control", "terminated")).unwrap();
        assert_eq!(json, r#"{"type":"put","topic":"control","message":"terminated"}"#);

        let json = serde_json::to_string(&Request::Shutdown).unwrap();
        assert_eq!(json, r#"{"type":"shutdown"}"#);
    }

    #[test]
    fn test_response_parse() {
        let resp: Response =
            serde_json::from_str(r#"{"type":"message","topic":"world_step","message":""}"#).unwrap();
        assert_eq!(
            resp,
            Response::Message {
                topic: "world_step".into(),
                message: String::new()
            }
        );
    }

    #[test]
    fn test_unknown_request_is_rejected() {
        assert!(serde_json::from_str::<Request>(r#"{"type":"subscribe","topic":"x"}"#).is_err());
    }
}
