//! Mailbox 客户端
//!
//! 每个循环持有自己的连接对象（构造时传入），用完显式 close。
//! `get` 非阻塞：没有新消息时返回空字符串；`drain_latest` 连续读取直到为空，只保留最后一条。

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec};

use super::message::{Request, Response};
use super::MAX_FRAME_LENGTH;
use crate::core::MailboxError;

pub struct MailboxClient {
    addr: String,
    framed: Option<Framed<TcpStream, LinesCodec>>,
}

impl MailboxClient {
    /// 创建未连接的客户端
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            addr: format!("{host}:{port}"),
            framed: None,
        }
    }

    /// 创建并立即连接
    pub async fn connect(host: &str, port: u16) -> Result<Self, MailboxError> {
        let mut client = Self::new(host, port);
        client.open().await?;
        Ok(client)
    }

    pub async fn open(&mut self) -> Result<(), MailboxError> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|source| MailboxError::Connect {
                addr: self.addr.clone(),
                source,
            })?;
        stream.set_nodelay(true)?;
        self.framed = Some(Framed::new(
            stream,
            LinesCodec::new_with_max_length(MAX_FRAME_LENGTH),
        ));
        tracing::debug!("Connected to mailbox at {}", self.addr);
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.framed.is_some()
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    fn framed(&mut self) -> Result<&mut Framed<TcpStream, LinesCodec>, MailboxError> {
        self.framed.as_mut().ok_or(MailboxError::ConnectionClosed)
    }

    async fn send(&mut self, request: &Request) -> Result<(), MailboxError> {
        let frame = serde_json::to_string(request)?;
        self.framed()?.send(frame).await?;
        Ok(())
    }

    /// 写入一条消息，不等待任何读者
    pub async fn put(&mut self, topic: &str, message: &str) -> Result<(), MailboxError> {
        self.send(&Request::put(topic, message)).await
    }

    /// 取出该 topic 上本连接最旧的未读消息；没有时返回空字符串
    pub async fn get(&mut self, topic: &str) -> Result<String, MailboxError> {
        self.send(&Request::get(topic)).await?;
        let line = match self.framed()?.next().await {
            Some(Ok(line)) => line,
            Some(Err(e)) => return Err(e.into()),
            None => {
                self.framed = None;
                return Err(MailboxError::ConnectionClosed);
            }
        };

        let response: Response = serde_json::from_str(&line)
            .map_err(|e| MailboxError::Protocol(format!("bad response {line:?}: {e}")))?;
        let Response::Message {
            topic: got,
            message,
        } = response;
        if got != topic {
            return Err(MailboxError::Protocol(format!(
                "response for topic {got:?} while waiting for {topic:?}"
            )));
        }
        Ok(message)
    }

    /// 读到空为止，返回最后一条非空消息
    pub async fn drain_latest(&mut self, topic: &str) -> Result<Option<String>, MailboxError> {
        let mut latest = None;
        loop {
            let message = self.get(topic).await?;
            if message.is_empty() {
                return Ok(latest);
            }
            latest = Some(message);
        }
    }

    /// 请求服务端停止（仅 Orchestrator 使用），随后关闭本连接
    pub async fn shutdown_server(&mut self) -> Result<(), MailboxError> {
        self.send(&Request::Shutdown).await?;
        self.close().await;
        Ok(())
    }

    /// 释放连接；可重复调用，未连接时无操作
    pub async fn close(&mut self) {
        if let Some(mut framed) = self.framed.take() {
            let _ = SinkExt::<String>::close(&mut framed).await;
            tracing::debug!("Closed mailbox connection to {}", self.addr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailbox::testing::{get_eventually, spawn_server};

    #[tokio::test]
    async fn test_drain_to_latest() {
        let (addr, _shutdown) = spawn_server(64).await;
        let mut client = MailboxClient::connect(&addr.ip().to_string(), addr.port())
            .await
            .unwrap();

        for i in 0..10 {
            client.put("t", &format!("v{i}")).await.unwrap();
        }
        assert_eq!(client.drain_latest("t").await.unwrap().as_deref(), Some("v9"));
        assert_eq!(client.get("t").await.unwrap(), "");
        assert_eq!(client.drain_latest("t").await.unwrap(), None);
        client.close().await;
    }

    #[tokio::test]
    async fn test_get_returns_oldest_first() {
        let (addr, _shutdown) = spawn_server(64).await;
        let mut client = MailboxClient::connect(&addr.ip().to_string(), addr.port())
            .await
            .unwrap();

        client.put("t", "first").await.unwrap();
        client.put("t", "second").await.unwrap();
        assert_eq!(client.get("t").await.unwrap(), "first");
        assert_eq!(client.get("t").await.unwrap(), "second");
        assert_eq!(client.get("empty").await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_every_reader_sees_control() {
        let (addr, _shutdown) = spawn_server(64).await;
        let host = addr.ip().to_string();
        let mut writer = MailboxClient::connect(&host, addr.port()).await.unwrap();
        let mut agent = MailboxClient::connect(&host, addr.port()).await.unwrap();
        let mut orchestrator = MailboxClient::connect(&host, addr.port()).await.unwrap();

        writer.put("control", "terminated").await.unwrap();
        assert_eq!(get_eventually(&mut agent, "control").await, "terminated");
        assert_eq!(get_eventually(&mut orchestrator, "control").await, "terminated");
    }

    #[tokio::test]
    async fn test_backlog_is_bounded() {
        let (addr, _shutdown) = spawn_server(3).await;
        let mut client = MailboxClient::connect(&addr.ip().to_string(), addr.port())
            .await
            .unwrap();

        for i in 0..10 {
            client.put("t", &i.to_string()).await.unwrap();
        }
        assert_eq!(client.get("t").await.unwrap(), "7");
        assert_eq!(client.drain_latest("t").await.unwrap().as_deref(), Some("9"));
    }

    #[tokio::test]
    async fn test_shutdown_closes_connections() {
        let (addr, shutdown) = spawn_server(8).await;
        let host = addr.ip().to_string();
        let mut admin = MailboxClient::connect(&host, addr.port()).await.unwrap();
        let mut peer = MailboxClient::connect(&host, addr.port()).await.unwrap();
        assert_eq!(peer.get("t").await.unwrap(), "");

        admin.shutdown_server().await.unwrap();
        assert!(!admin.is_open());
        tokio::time::timeout(std::time::Duration::from_secs(2), shutdown.wait_for_shutdown())
            .await
            .unwrap();

        let mut closed = false;
        for _ in 0..50 {
            match peer.get("t").await {
                Err(e) => {
                    assert!(e.is_disconnect(), "unexpected error: {e}");
                    closed = true;
                    break;
                }
                Ok(_) => tokio::time::sleep(std::time::Duration::from_millis(20)).await,
            }
        }
        assert!(closed);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let mut never_opened = MailboxClient::new("127.0.0.1", 1);
        never_opened.close().await;
        never_opened.close().await;
        assert!(matches!(
            never_opened.get("t").await,
            Err(MailboxError::ConnectionClosed)
        ));

        let (addr, _shutdown) = spawn_server(8).await;
        let mut client = MailboxClient::connect(&addr.ip().to_string(), addr.port())
            .await
            .unwrap();
        client.close().await;
        client.close().await;
        assert!(!client.is_open());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let err = MailboxClient::connect("127.0.0.1", port).await.err().unwrap();
        assert!(matches!(err, MailboxError::Connect { .. }));
    }
}
