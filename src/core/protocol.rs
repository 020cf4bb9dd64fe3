//! 交互协议：topic 名称、world_step / agent_step 消息与 control 信号
//!
//! 消息以 JSON 文本在 mailbox 中传递。读取端对畸形负载宽容：
//! 缺失、类型错误或维度不符的字段保留上一次的值，而不是让循环崩溃。

use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// World 每个交互步发布的观测
pub const WORLD_STEP: &str = "world_step";
/// Agent 每次决策（及每次轮询）发布的动作
pub const AGENT_STEP: &str = "agent_step";
/// 回合 / 运行生命周期信号
pub const CONTROL: &str = "control";

/// 当前 UNIX 时间（秒，含小数）
pub fn unix_timestamp() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// world_step 消息
///
/// `rewards` 中的 `None` 表示该奖励通道本步未触发，与 0.0 语义不同，序列化为 JSON `null`。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepMessage {
    pub sensors: Vec<f64>,
    pub rewards: Vec<Option<f64>>,
    pub loop_step: u64,
    pub episode: u64,
}

impl StepMessage {
    /// 全零观测（所有奖励通道为 0.0）
    pub fn zeroed(n_sensors: usize, n_rewards: usize) -> Self {
        Self {
            sensors: vec![0.0; n_sensors],
            rewards: vec![Some(0.0); n_rewards],
            loop_step: 0,
            episode: 0,
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// 已触发奖励通道之和
    pub fn total_reward(&self) -> f64 {
        total_reward(&self.rewards)
    }

    /// 用原始负载逐字段覆盖当前值；只有 JSON 本身无法解析为对象时才返回错误
    pub fn patch(&mut self, raw: &str) -> Result<(), PayloadError> {
        let obj = parse_object(raw)?;
        if let Some(sensors) = field::<Vec<f64>>(&obj, "sensors") {
            if same_arity(&self.sensors, &sensors) {
                self.sensors = sensors;
            }
        }
        if let Some(rewards) = field::<Vec<Option<f64>>>(&obj, "rewards") {
            if same_arity(&self.rewards, &rewards) {
                self.rewards = rewards;
            }
        }
        if let Some(loop_step) = field(&obj, "loop_step") {
            self.loop_step = loop_step;
        }
        if let Some(episode) = field(&obj, "episode") {
            self.episode = episode;
        }
        Ok(())
    }
}

/// 已触发奖励通道之和（缺席通道不计入）
pub fn total_reward(rewards: &[Option<f64>]) -> f64 {
    rewards.iter().flatten().sum()
}

/// agent_step 消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionMessage {
    pub actions: Vec<f64>,
    pub step: u64,
    pub episode: u64,
    pub timestamp: f64,
}

impl ActionMessage {
    pub fn new(actions: Vec<f64>, step: u64, episode: u64) -> Self {
        Self {
            actions,
            step,
            episode,
            timestamp: unix_timestamp(),
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// 从原始负载中取出动作向量；缺失、类型错误或维度不符时返回 None
    pub fn actions_from(raw: &str, n_actions: usize) -> Result<Option<Vec<f64>>, PayloadError> {
        let obj = parse_object(raw)?;
        Ok(field::<Vec<f64>>(&obj, "actions").filter(|a| a.len() == n_actions))
    }
}

/// control 信号
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    /// 回合结束，运行继续
    Truncated,
    /// 运行结束
    Terminated,
    /// 外部注入的停止请求，与 Terminated 等价
    Shutdown,
}

impl ControlSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlSignal::Truncated => "truncated",
            ControlSignal::Terminated => "terminated",
            ControlSignal::Shutdown => "shutdown",
        }
    }

    /// 是否结束整个运行
    pub fn ends_run(&self) -> bool {
        matches!(self, ControlSignal::Terminated | ControlSignal::Shutdown)
    }
}

impl fmt::Display for ControlSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ControlSignal {
    type Err = PayloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "truncated" => Ok(ControlSignal::Truncated),
            "terminated" => Ok(ControlSignal::Terminated),
            "shutdown" => Ok(ControlSignal::Shutdown),
            other => Err(PayloadError::UnknownSignal(other.to_string())),
        }
    }
}

/// 负载无法使用（不是 JSON 对象 / 未知 control 值）
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("payload is not a JSON object: {0}")]
    NotAnObject(String),
    #[error("unknown control signal: {0:?}")]
    UnknownSignal(String),
}

fn parse_object(raw: &str) -> Result<Map<String, Value>, PayloadError> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(obj)) => Ok(obj),
        Ok(other) => Err(PayloadError::NotAnObject(other.to_string())),
        Err(e) => Err(PayloadError::NotAnObject(e.to_string())),
    }
}

fn field<T: DeserializeOwned>(obj: &Map<String, Value>, key: &str) -> Option<T> {
    obj.get(key)
        .and_then(|v| serde_json::from_value(v.clone()).ok())
}

/// 维度固定：当前向量为空（尚未确定维度）时接受任何长度
fn same_arity<T, U>(current: &[T], incoming: &[U]) -> bool {
    current.is_empty() || current.len() == incoming.len()
}
