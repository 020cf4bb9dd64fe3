//! 错误类型
//!
//! MailboxError 覆盖传输层（连接、断开、编解码、协议）；BenchError 覆盖配置、循环与进程编排层。
//! 传输错误不在循环内重试，直接向上传播并结束进程，由 Orchestrator 的超时兜底。

use std::io;

use thiserror::Error;
use tokio_util::codec::LinesCodecError;

/// Mailbox 客户端 / 服务端可能出现的错误
#[derive(Error, Debug)]
pub enum MailboxError {
    #[error("Failed to connect to mailbox at {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// 连接已断开（对端关闭或本端已 close）
    #[error("Mailbox connection closed")]
    ConnectionClosed,

    #[error("Mailbox I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Mailbox codec error: {0}")]
    Codec(LinesCodecError),

    #[error("Mailbox protocol error: {0}")]
    Protocol(String),

    #[error("Failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
}

impl From<LinesCodecError> for MailboxError {
    fn from(err: LinesCodecError) -> Self {
        match err {
            LinesCodecError::Io(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::BrokenPipe
                        | io::ErrorKind::ConnectionReset
                        | io::ErrorKind::ConnectionAborted
                        | io::ErrorKind::UnexpectedEof
                ) =>
            {
                MailboxError::ConnectionClosed
            }
            other => MailboxError::Codec(other),
        }
    }
}

impl MailboxError {
    /// 是否为「连接已不可用」类错误
    pub fn is_disconnect(&self) -> bool {
        matches!(self, MailboxError::ConnectionClosed)
    }
}

/// 实验运行过程中的错误（配置、环境/策略构造、循环、子进程）
#[derive(Error, Debug)]
pub enum BenchError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Invalid rate: {0} (must be finite and > 0)")]
    InvalidRate(f64),

    #[error("Unknown world kind: {0}")]
    UnknownWorld(String),

    #[error("Unknown agent kind: {0}")]
    UnknownAgent(String),

    #[error(transparent)]
    Mailbox(#[from] MailboxError),

    #[error("Process '{name}' failed: {message}")]
    Process { name: String, message: String },
}
