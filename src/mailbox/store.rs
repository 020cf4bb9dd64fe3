//! Topic 存储
//!
//! 所有 topic 共用一个递增序号；每个 topic 只保留最近 `capacity` 条。
//! 每个连接持有自己的 ReadCursor，因此多个读者互不抢占，各自按顺序读到全部保留消息。

use std::collections::{HashMap, VecDeque};

#[derive(Debug, Clone)]
struct Entry {
    seq: u64,
    message: String,
}

/// 内存中的 topic 表
#[derive(Debug)]
pub struct TopicStore {
    topics: HashMap<String, VecDeque<Entry>>,
    next_seq: u64,
    capacity: usize,
}

/// 单个连接的读位置：topic → 已读到的最大序号
#[derive(Debug, Default, Clone)]
pub struct ReadCursor {
    delivered: HashMap<String, u64>,
}

impl TopicStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: HashMap::new(),
            next_seq: 1,
            capacity: capacity.max(1),
        }
    }

    /// 追加消息；积压超过容量时丢弃最旧的，返回丢弃条数
    pub fn put(&mut self, topic: &str, message: String) -> usize {
        let seq = self.next_seq;
        self.next_seq += 1;

        let queue = self.topics.entry(topic.to_string()).or_default();
        queue.push_back(Entry { seq, message });

        let mut dropped = 0;
        while queue.len() > self.capacity {
            queue.pop_front();
            dropped += 1;
        }
        dropped
    }

    /// 返回 cursor 之后最旧的一条并推进 cursor；没有新消息时返回 None
    pub fn next_after(&self, topic: &str, cursor: &mut ReadCursor) -> Option<String> {
        let queue = self.topics.get(topic)?;
        let last = cursor.delivered.get(topic).copied().unwrap_or(0);
        let idx = queue.partition_point(|entry| entry.seq <= last);
        let entry = queue.get(idx)?;
        cursor.delivered.insert(topic.to_string(), entry.seq);
        Some(entry.message.clone())
    }

    /// 该 topic 当前保留的消息数
    pub fn backlog(&self, topic: &str) -> usize {
        self.topics.get(topic).map_or(0, VecDeque::len)
    }
}
