//! Agent 轮询循环
//!
//! 每次轮询：固定延迟 → 把 world_step 读到最新 → 读一次 control → 重发上一次的动作。
//! 处理顺序：terminated / shutdown 优先，其次 truncated，最后才是新观测上的决策。
//!
//! 回合号以 World 为准，本地只保存一个镜像：
//! - world_step 的 episode 大于镜像：隐式进入新回合（重置策略并采用该回合号）
//! - world_step 的 episode 小于镜像：上一回合的迟到数据，丢弃
//! - 第 k 个 truncated 表示 World 已进入第 k 回合；镜像已经到达时忽略

use std::time::Duration;

use crate::config::AppConfig;
use crate::core::protocol::{ActionMessage, ControlSignal, StepMessage, AGENT_STEP, CONTROL, WORLD_STEP};
use crate::core::{BenchError, MailboxError};
use crate::mailbox::MailboxClient;
use crate::world::{build_environment, Shape};

use super::{build_policy, Policy};

/// 一次运行结束时的统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentSummary {
    /// 退出时镜像的回合号
    pub final_episode: u64,
    /// 决策次数（全部回合）
    pub decisions: u64,
    /// 丢弃的过期 world_step 数
    pub stale_discarded: u64,
    pub stop_signal: Option<String>,
}

pub struct AgentLoop {
    policy: Box<dyn Policy>,
    client: MailboxClient,
    shape: Shape,
    polling_delay: Duration,

    episode: u64,
    /// 当前回合内的决策序号
    step: u64,
    truncations_seen: u64,
    observation: StepMessage,
    actions: Vec<f64>,
    summary: AgentSummary,
}

impl AgentLoop {
    pub fn new(policy: Box<dyn Policy>, client: MailboxClient, shape: Shape, polling_delay: Duration) -> Self {
        Self {
            policy,
            client,
            shape,
            polling_delay,
            episode: 0,
            step: 0,
            truncations_seen: 0,
            observation: StepMessage::zeroed(shape.n_sensors, shape.n_rewards),
            actions: vec![0.0; shape.n_actions],
            summary: AgentSummary::default(),
        }
    }

    /// 运行到 terminated / shutdown；传输错误直接返回
    pub async fn run(mut self) -> Result<AgentSummary, BenchError> {
        let result = self.poll_until_done().await;
        self.client.close().await;
        result?;
        self.summary.final_episode = self.episode;
        Ok(self.summary)
    }

    async fn poll_until_done(&mut self) -> Result<(), BenchError> {
        tracing::info!(agent = self.policy.name(), "Agent loop starting");
        self.start_episode(0);

        loop {
            tokio::time::sleep(self.polling_delay).await;

            let mut fresh = self.read_world_step().await?;

            match self.control_check().await? {
                Some(signal) if signal.ends_run() => {
                    tracing::info!(episode = self.episode, %signal, "Agent stopping");
                    self.summary.stop_signal = Some(signal.to_string());
                    return Ok(());
                }
                Some(_) => {
                    self.truncations_seen += 1;
                    if self.truncations_seen > self.episode {
                        self.start_episode(self.truncations_seen);
                        // 本轮读到的观测属于上一回合
                        fresh = false;
                    } else {
                        tracing::debug!(
                            truncation = self.truncations_seen,
                            episode = self.episode,
                            "Episode already adopted, ignoring truncated"
                        );
                    }
                }
                None => {}
            }

            self.publish().await?;

            if fresh {
                self.actions = self
                    .policy
                    .choose_action(&self.observation.sensors, &self.observation.rewards);
                self.publish().await?;
                self.step += 1;
                self.summary.decisions += 1;
            }
        }
    }

    fn start_episode(&mut self, episode: u64) {
        self.episode = episode;
        self.step = 0;
        self.observation = StepMessage::zeroed(self.shape.n_sensors, self.shape.n_rewards);
        self.observation.episode = episode;
        self.actions = vec![0.0; self.shape.n_actions];
        self.policy.reset();
        tracing::info!(episode, "Agent episode start");
    }

    /// world_step 读到最新并合并进当前观测；返回是否得到了本回合的新观测
    async fn read_world_step(&mut self) -> Result<bool, BenchError> {
        let Some(raw) = self.client.drain_latest(WORLD_STEP).await? else {
            return Ok(false);
        };

        let mut candidate = self.observation.clone();
        if let Err(e) = candidate.patch(&raw) {
            tracing::warn!("Malformed world_step ignored: {}", e);
            return Ok(false);
        }

        if candidate.episode < self.episode {
            tracing::debug!(
                got = candidate.episode,
                episode = self.episode,
                "Discarding world_step from a finished episode"
            );
            self.summary.stale_discarded += 1;
            return Ok(false);
        }
        if candidate.episode > self.episode {
            tracing::info!(
                from = self.episode,
                to = candidate.episode,
                "World moved to a new episode before truncated arrived"
            );
            self.start_episode(candidate.episode);
        }

        self.observation = candidate;
        Ok(true)
    }

    /// 读一次 control（不循环读取）
    async fn control_check(&mut self) -> Result<Option<ControlSignal>, BenchError> {
        let raw = self.client.get(CONTROL).await?;
        if raw.is_empty() {
            return Ok(None);
        }
        match raw.parse::<ControlSignal>() {
            Ok(signal) => Ok(Some(signal)),
            Err(e) => {
                tracing::warn!("Ignoring control message: {}", e);
                Ok(None)
            }
        }
    }

    async fn publish(&mut self) -> Result<(), BenchError> {
        let message = ActionMessage::new(self.actions.clone(), self.step, self.episode);
        let payload = message.encode().map_err(MailboxError::from)?;
        self.client.put(AGENT_STEP, &payload).await?;
        Ok(())
    }
}

/// `tandem agent` 入口：环境维度由同一份配置构造出的环境决定
pub async fn run_agent_process(cfg: &AppConfig) -> Result<AgentSummary, BenchError> {
    let shape = build_environment(&cfg.world)?.shape();
    let policy = build_policy(&cfg.agent, shape)?;
    let client = MailboxClient::connect(&cfg.mailbox.host, cfg.mailbox.port).await?;

    AgentLoop::new(policy, client, shape, Duration::from_millis(cfg.agent.polling_delay_ms))
        .run()
        .await
}
