//! Mailbox：按 topic 寻址的内存消息服务
//!
//! - `put(topic, message)`：追加，不等待读者
//! - `get(topic)`：取出本连接最旧的未读消息，没有则返回空字符串
//! - `shutdown`：管理命令，停止服务并断开所有连接
//!
//! 不做持久化，不保证跨 topic 的顺序；同一连接写入的同一 topic 按顺序可见。

mod client;
mod message;
mod server;
mod store;

pub use client::MailboxClient;
pub use message::{Request, Response};
pub use server::{serve, MailboxServer};
pub use store::{ReadCursor, TopicStore};

/// 单帧最大长度（字节）
pub(crate) const MAX_FRAME_LENGTH: usize = 1 << 20;
