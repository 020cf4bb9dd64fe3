//! 实验配置：从 config/default.toml、--config 文件与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `TANDEM__*` 覆盖（双下划线表示嵌套，如 `TANDEM__WORLD__N_EPISODES=3`）。
//! Orchestrator 会把解析后的配置落盘为 TOML，并把路径传给每个子进程，保证所有进程看到同一份配置。

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::BenchError;

/// 配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    pub mailbox: MailboxSection,
    pub world: WorldSection,
    pub agent: AgentSection,
    pub bench: BenchSection,
}

/// [mailbox] 段：服务地址与每个 topic 的积压上限
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MailboxSection {
    #[serde(default = "default_mailbox_host")]
    pub host: String,
    #[serde(default = "default_mailbox_port")]
    pub port: u16,
    /// 单个 topic 最多保留的消息数，超出时丢弃最旧的
    #[serde(default = "default_topic_capacity")]
    pub topic_capacity: usize,
}

fn default_mailbox_host() -> String {
    "127.0.0.1".to_string()
}

fn default_mailbox_port() -> u16 {
    30008
}

fn default_topic_capacity() -> usize {
    256
}

impl Default for MailboxSection {
    fn default() -> Self {
        Self {
            host: default_mailbox_host(),
            port: default_mailbox_port(),
            topic_capacity: default_topic_capacity(),
        }
    }
}

/// [world] 段：环境类型、回合长度与时钟频率
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorldSection {
    /// reference / stationary_bandit / contextual_bandit / pendulum
    #[serde(default = "default_world_kind")]
    pub kind: String,
    /// 每个回合的交互步数
    #[serde(default = "default_n_loop_steps")]
    pub n_loop_steps: u64,
    #[serde(default = "default_n_episodes")]
    pub n_episodes: u64,
    /// 与 Agent 交互的频率（Hz）
    #[serde(default = "default_loop_steps_per_second")]
    pub loop_steps_per_second: f64,
    /// 环境内部仿真频率（Hz），未设置时与交互频率相同
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub world_steps_per_second: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

fn default_world_kind() -> String {
    "reference".to_string()
}

fn default_n_loop_steps() -> u64 {
    100
}

fn default_n_episodes() -> u64 {
    1
}

fn default_loop_steps_per_second() -> f64 {
    10.0
}

impl Default for WorldSection {
    fn default() -> Self {
        Self {
            kind: default_world_kind(),
            n_loop_steps: default_n_loop_steps(),
            n_episodes: default_n_episodes(),
            loop_steps_per_second: default_loop_steps_per_second(),
            world_steps_per_second: None,
            seed: None,
        }
    }
}

/// [agent] 段：策略类型、轮询间隔与学习参数
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AgentSection {
    /// zero / random / q_learning / q_learning_curiosity
    #[serde(default = "default_agent_kind")]
    pub kind: String,
    /// 两次轮询之间的固定延迟（毫秒）。
    /// 越小 mailbox 负载越高；越大 control 信号与新观测的延迟越高，
    /// 2ms 时本机回环下单次交互延迟约为 2~4ms。
    #[serde(default = "default_polling_delay_ms")]
    pub polling_delay_ms: u64,
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_discount_factor")]
    pub discount_factor: f64,
    /// 大于该值的动作分量视为「已执行」
    #[serde(default = "default_action_threshold")]
    pub action_threshold: f64,
    /// 好奇心权重（q_learning_curiosity），按动作数平摊
    #[serde(default = "default_curiosity_scale")]
    pub curiosity_scale: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

fn default_agent_kind() -> String {
    "random".to_string()
}

fn default_polling_delay_ms() -> u64 {
    2
}

fn default_epsilon() -> f64 {
    0.2
}

fn default_learning_rate() -> f64 {
    0.01
}

fn default_discount_factor() -> f64 {
    0.5
}

fn default_action_threshold() -> f64 {
    0.5
}

fn default_curiosity_scale() -> f64 {
    1.0
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            kind: default_agent_kind(),
            polling_delay_ms: default_polling_delay_ms(),
            epsilon: default_epsilon(),
            learning_rate: default_learning_rate(),
            discount_factor: default_discount_factor(),
            action_threshold: default_action_threshold(),
            curiosity_scale: default_curiosity_scale(),
            seed: None,
        }
    }
}

/// [bench] 段：超时、预热、健康检查频率、关闭超时与结果记录
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BenchSection {
    /// 整个运行的墙钟超时（秒），未设置时不限时
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<f64>,
    /// 启动 mailbox 后等待其可连接的时间
    #[serde(default = "default_warmup_ms")]
    pub warmup_ms: u64,
    #[serde(default = "default_health_check_hz")]
    pub health_check_hz: f64,
    /// 关闭阶段每一步的等待上限
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
    #[serde(default)]
    pub log_to_db: bool,
    #[serde(default = "default_log_directory")]
    pub log_directory: PathBuf,
    #[serde(default = "default_db_name")]
    pub db_name: String,
    #[serde(default = "default_logging_hz")]
    pub logging_hz: f64,
}

fn default_warmup_ms() -> u64 {
    500
}

fn default_health_check_hz() -> f64 {
    10.0
}

fn default_shutdown_timeout_ms() -> u64 {
    1000
}

fn default_log_directory() -> PathBuf {
    PathBuf::from("logs")
}

fn default_db_name() -> String {
    "bench".to_string()
}

fn default_logging_hz() -> f64 {
    100.0
}

impl Default for BenchSection {
    fn default() -> Self {
        Self {
            timeout_secs: None,
            warmup_ms: default_warmup_ms(),
            health_check_hz: default_health_check_hz(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            log_to_db: false,
            log_directory: default_log_directory(),
            db_name: default_db_name(),
            logging_hz: default_logging_hz(),
        }
    }
}

/// 频率必须为正，且对应的周期可以用 Duration 表示
fn positive_rate(name: &str, value: f64) -> Result<(), BenchError> {
    let representable = value.is_finite()
        && value > 0.0
        && Duration::try_from_secs_f64(1.0 / value).is_ok_and(|period| !period.is_zero());
    if representable {
        Ok(())
    } else {
        Err(BenchError::Config(format!("{name} must be a positive rate, got {value}")))
    }
}

impl AppConfig {
    /// 检查会让循环无法运行的取值（非正频率、零长度回合、零容量 topic）
    pub fn validate(&self) -> Result<(), BenchError> {
        if self.mailbox.topic_capacity == 0 {
            return Err(BenchError::Config("mailbox.topic_capacity must be at least 1".into()));
        }
        if self.world.n_loop_steps == 0 {
            return Err(BenchError::Config("world.n_loop_steps must be at least 1".into()));
        }
        positive_rate("world.loop_steps_per_second", self.world.loop_steps_per_second)?;
        if let Some(rate) = self.world.world_steps_per_second {
            positive_rate("world.world_steps_per_second", rate)?;
        }
        positive_rate("bench.health_check_hz", self.bench.health_check_hz)?;
        positive_rate("bench.logging_hz", self.bench.logging_hz)?;
        if let Some(timeout) = self.bench.timeout_secs {
            if Duration::try_from_secs_f64(timeout).is_err() {
                return Err(BenchError::Config(format!(
                    "bench.timeout_secs must be non-negative, got {timeout}"
                )));
            }
        }
        Ok(())
    }

    /// 序列化为 TOML，供子进程通过 --config 读取
    pub fn to_toml(&self) -> Result<String, BenchError> {
        toml::to_string(self).map_err(|e| BenchError::Config(format!("serialize config: {e}")))
    }

    /// 写入指定路径（父目录不存在时自动创建）
    pub fn write_to(&self, path: &Path) -> Result<(), BenchError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| BenchError::Config(format!("create {}: {e}", parent.display())))?;
        }
        std::fs::write(path, self.to_toml()?)
            .map_err(|e| BenchError::Config(format!("write {}: {e}", path.display())))
    }
}

/// 从 config 目录加载配置，环境变量 TANDEM__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml，找到则作为第一源
/// 2. 若传入 config_path，则追加该文件（必须存在，可覆盖前面的键）
/// 3. 最后叠加环境变量 TANDEM__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(path) = config_path {
        builder = builder.add_source(config::File::from(path).required(true));
    }

    builder = builder.add_source(
        config::Environment::with_prefix("TANDEM")
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}
