//! Mailbox 服务端
//!
//! 单实例、纯内存。每个 TCP 连接一个任务，连接各自维护读位置；
//! 收到 shutdown 请求或系统信号后停止监听，并断开所有连接。

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::codec::{Framed, LinesCodec};

use super::message::{Request, Response};
use super::store::{ReadCursor, TopicStore};
use super::MAX_FRAME_LENGTH;
use crate::config::AppConfig;
use crate::core::shutdown::{ShutdownManager, ShutdownReason};
use crate::core::MailboxError;

pub struct MailboxServer {
    listener: TcpListener,
    store: Arc<Mutex<TopicStore>>,
    shutdown: Arc<ShutdownManager>,
}

impl MailboxServer {
    /// 绑定监听地址（端口为 0 时由系统分配）
    pub async fn bind(
        addr: &str,
        topic_capacity: usize,
        shutdown: Arc<ShutdownManager>,
    ) -> Result<Self, MailboxError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            store: Arc::new(Mutex::new(TopicStore::new(topic_capacity))),
            shutdown,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, MailboxError> {
        Ok(self.listener.local_addr()?)
    }

    /// 接受连接直到收到关闭信号，返回停止原因
    pub async fn serve(self) -> Result<Option<ShutdownReason>, MailboxError> {
        let token = self.shutdown.token();
        tracing::info!("Mailbox listening on {}", self.local_addr()?);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let store = Arc::clone(&self.store);
                            let shutdown = Arc::clone(&self.shutdown);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, store, shutdown).await {
                                    tracing::warn!("Mailbox connection {} ended with error: {}", addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
            }
        }

        let reason = self.shutdown.reason();
        tracing::info!(?reason, "Mailbox stopped");
        Ok(reason)
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    store: Arc<Mutex<TopicStore>>,
    shutdown: Arc<ShutdownManager>,
) -> Result<(), MailboxError> {
    stream.set_nodelay(true)?;
    let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_FRAME_LENGTH));
    let mut cursor = ReadCursor::default();
    let token = shutdown.token();

    tracing::debug!("Mailbox client connected: {}", addr);

    loop {
        let line = tokio::select! {
            _ = token.cancelled() => break,
            frame = framed.next() => match frame {
                Some(Ok(line)) => line,
                Some(Err(e)) => return Err(e.into()),
                None => break,
            },
        };

        let request: Request = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!("Malformed frame from {}, closing connection: {}", addr, e);
                break;
            }
        };

        match request {
            Request::Put { topic, message } => {
                let dropped = store.lock().await.put(&topic, message);
                if dropped > 0 {
                    tracing::debug!(topic = %topic, dropped, "Topic backlog full, dropped oldest");
                }
            }
            Request::Get { topic } => {
                let message = store
                    .lock()
                    .await
                    .next_after(&topic, &mut cursor)
                    .unwrap_or_default();
                let frame = serde_json::to_string(&Response::Message { topic, message })?;
                framed.send(frame).await?;
            }
            Request::Shutdown => {
                tracing::info!("Shutdown requested by {}", addr);
                shutdown.shutdown(ShutdownReason::Requested);
                break;
            }
        }
    }

    tracing::debug!("Mailbox client disconnected: {}", addr);
    Ok(())
}

/// `tandem serve` 入口：按配置绑定并运行，直到 shutdown 请求或 Ctrl+C / SIGTERM
pub async fn serve(cfg: &AppConfig) -> anyhow::Result<()> {
    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();

    let addr = format!("{}:{}", cfg.mailbox.host, cfg.mailbox.port);
    let server = MailboxServer::bind(&addr, cfg.mailbox.topic_capacity, shutdown)
        .await
        .with_context(|| format!("bind mailbox on {addr}"))?;
    if let Some(reason) = server.serve().await? {
        tracing::debug!(?reason, "Mailbox process exiting");
    }
    Ok(())
}
