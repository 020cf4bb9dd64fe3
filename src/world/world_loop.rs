//! World 交互循环
//!
//! 每个回合：重置环境 → n_loop_steps 个交互步 → 发布 `truncated`；全部回合结束后发布 `terminated`。
//! 每个交互步包含 world_steps_per_loop_step 个子步，每个子步先按节拍器等待，
//! 再把 agent_step 读到最新（没有新动作时使用全零动作），然后推进环境。
//! 每个子步开始前检查一次 control，遇到 terminated / shutdown 立即停止。

use crate::config::{AppConfig, WorldSection};
use crate::core::pacemaker::Pacemaker;
use crate::core::protocol::{ActionMessage, ControlSignal, StepMessage, AGENT_STEP, CONTROL, WORLD_STEP};
use crate::core::{BenchError, MailboxError};
use crate::mailbox::MailboxClient;

use super::{build_environment, Environment};

/// 交互频率与仿真频率
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorldTiming {
    pub loop_steps_per_second: f64,
    /// 每个交互步包含的子步数（≥ 1）
    pub world_steps_per_loop_step: u32,
    /// 实际仿真频率 = 子步数 × 交互频率
    pub world_steps_per_second: f64,
}

impl WorldTiming {
    /// 仿真频率取最接近交互频率整数倍的值，未配置时与交互频率相同
    pub fn new(loop_steps_per_second: f64, world_steps_per_second: Option<f64>) -> Result<Self, BenchError> {
        if !(loop_steps_per_second.is_finite() && loop_steps_per_second > 0.0) {
            return Err(BenchError::InvalidRate(loop_steps_per_second));
        }
        let requested = world_steps_per_second.unwrap_or(loop_steps_per_second);
        if !(requested.is_finite() && requested > 0.0) {
            return Err(BenchError::InvalidRate(requested));
        }

        let ratio = (requested / loop_steps_per_second).round().max(1.0) as u32;
        Ok(Self {
            loop_steps_per_second,
            world_steps_per_loop_step: ratio,
            world_steps_per_second: f64::from(ratio) * loop_steps_per_second,
        })
    }

    pub fn from_section(section: &WorldSection) -> Result<Self, BenchError> {
        Self::new(section.loop_steps_per_second, section.world_steps_per_second)
    }
}

/// 一次运行结束时的统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorldSummary {
    pub episodes_completed: u64,
    pub loop_steps: u64,
    /// 节拍超时次数
    pub overruns: u64,
    /// 是否被 terminated / shutdown 提前停止
    pub cancelled: bool,
}

pub struct WorldLoop {
    env: Box<dyn Environment>,
    client: MailboxClient,
    timing: WorldTiming,
    n_loop_steps: u64,
    n_episodes: u64,
}

impl WorldLoop {
    pub fn new(
        env: Box<dyn Environment>,
        client: MailboxClient,
        timing: WorldTiming,
        n_loop_steps: u64,
        n_episodes: u64,
    ) -> Self {
        Self {
            env,
            client,
            timing,
            n_loop_steps,
            n_episodes,
        }
    }

    /// 运行全部回合；传输错误直接返回，不重试
    pub async fn run(mut self) -> Result<WorldSummary, BenchError> {
        let result = self.run_episodes().await;
        self.client.close().await;
        result
    }

    async fn run_episodes(&mut self) -> Result<WorldSummary, BenchError> {
        let mut pacemaker = Pacemaker::new(self.timing.world_steps_per_second)?;
        let mut summary = WorldSummary::default();

        tracing::info!(
            world = self.env.name(),
            episodes = self.n_episodes,
            loop_steps = self.n_loop_steps,
            sub_steps = self.timing.world_steps_per_loop_step,
            "World loop starting"
        );

        'run: for episode in 0..self.n_episodes {
            self.env.reset();
            tracing::debug!(episode, "Episode reset");

            for loop_step in 0..self.n_loop_steps {
                for _ in 0..self.timing.world_steps_per_loop_step {
                    if let Some(signal) = self.control_check().await? {
                        tracing::info!(episode, loop_step, %signal, "World stopping on control signal");
                        summary.cancelled = true;
                        break 'run;
                    }

                    let overrun = pacemaker.beat().await;
                    if overrun > 0.0 {
                        summary.overruns += 1;
                        tracing::debug!(overrun, "World sub-step overran its period");
                    }
                    let actions = self.read_agent_step().await?;
                    self.env.advance_substep(&actions);
                }

                let observation = self.env.observe();
                let message = StepMessage {
                    sensors: observation.sensors,
                    rewards: observation.rewards,
                    loop_step,
                    episode,
                };
                let payload = message.encode().map_err(MailboxError::from)?;
                self.client.put(WORLD_STEP, &payload).await?;
                summary.loop_steps += 1;
            }

            self.client.put(CONTROL, ControlSignal::Truncated.as_str()).await?;
            summary.episodes_completed += 1;
            tracing::info!(episode, "Episode complete");
        }

        if !summary.cancelled {
            self.client.put(CONTROL, ControlSignal::Terminated.as_str()).await?;
            tracing::info!(
                episodes = summary.episodes_completed,
                overruns = summary.overruns,
                "World run complete"
            );
        }
        Ok(summary)
    }

    /// 检查 control 积压，返回第一个结束运行的信号（自己发出的 truncated 忽略）
    async fn control_check(&mut self) -> Result<Option<ControlSignal>, BenchError> {
        loop {
            let raw = self.client.get(CONTROL).await?;
            if raw.is_empty() {
                return Ok(None);
            }
            match raw.parse::<ControlSignal>() {
                Ok(signal) if signal.ends_run() => return Ok(Some(signal)),
                Ok(_) => {}
                Err(e) => tracing::warn!("Ignoring control message: {}", e),
            }
        }
    }

    /// agent_step 读到空为止，取最后一条可用的动作；一条都没有时为全零动作
    async fn read_agent_step(&mut self) -> Result<Vec<f64>, BenchError> {
        let n_actions = self.env.shape().n_actions;
        let mut latest = None;

        loop {
            let raw = self.client.get(AGENT_STEP).await?;
            if raw.is_empty() {
                break;
            }
            match ActionMessage::actions_from(&raw, n_actions) {
                Ok(Some(actions)) => latest = Some(actions),
                Ok(None) => tracing::warn!("agent_step has no usable actions for {} outputs", n_actions),
                Err(e) => tracing::warn!("Malformed agent_step ignored: {}", e),
            }
        }

        Ok(latest.unwrap_or_else(|| vec![0.0; n_actions]))
    }
}

/// `tandem world` 入口
pub async fn run_world_process(cfg: &AppConfig) -> Result<WorldSummary, BenchError> {
    let env = build_environment(&cfg.world)?;
    let timing = WorldTiming::from_section(&cfg.world)?;
    let client = MailboxClient::connect(&cfg.mailbox.host, cfg.mailbox.port).await?;

    WorldLoop::new(env, client, timing, cfg.world.n_loop_steps, cfg.world.n_episodes)
        .run()
        .await
}
