//! 关闭处理
//!
//! - ShutdownManager：mailbox 服务的停止开关（CancellationToken），记录第一个触发原因
//! - TeardownCoordinator：按顺序执行关闭步骤，每一步都有超时上限，并汇总出进程退出码

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// mailbox 停止的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// 客户端发来 shutdown 请求（Orchestrator 的 shutdown_server）
    Requested,
    /// Ctrl+C
    Interrupt,
    /// SIGTERM
    Terminate,
}

/// 停止开关：取消 token，并保留最先到达的原因
#[derive(Debug, Default)]
pub struct ShutdownManager {
    token: CancellationToken,
    reason: OnceLock<ShutdownReason>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 连接任务与监听循环共用的 token
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// 触发停止；重复调用时保留第一次的原因
    pub fn shutdown(&self, reason: ShutdownReason) {
        if self.reason.set(reason).is_err() {
            tracing::debug!(?reason, "Shutdown already in progress");
        }
        self.token.cancel();
    }

    /// 尚未停止时为 None
    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.get().copied()
    }

    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }

    /// Ctrl+C 与 SIGTERM 都转成一次 shutdown
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Received Ctrl+C, stopping mailbox");
                manager.shutdown(ShutdownReason::Interrupt);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    tracing::info!("Received SIGTERM, stopping mailbox");
                    manager.shutdown(ShutdownReason::Terminate);
                }
            });
        }
    }
}

/// 单个关闭步骤的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// 按时、正常退出
    Clean,
    /// 超时后被强制终止
    Forced,
    /// 组件报告失败（非零退出码、任务出错等）
    Failed(String),
}

impl StepOutcome {
    pub fn is_clean(&self) -> bool {
        matches!(self, StepOutcome::Clean)
    }
}

/// 关闭步骤：自身负责「先礼后兵」，协调器只在外层再加一道超时
#[async_trait::async_trait]
pub trait TeardownStep: Send {
    async fn run(&mut self) -> StepOutcome;

    /// 步骤名称（用于日志与报告）
    fn name(&self) -> &str;
}

/// 关闭报告：每一步的名称与结果
#[derive(Debug, Default, Clone)]
pub struct TeardownReport {
    pub steps: Vec<(String, StepOutcome)>,
}

impl TeardownReport {
    /// 全部步骤干净退出时为 0，否则为 1
    pub fn exit_code(&self) -> i32 {
        if self.steps.iter().all(|(_, outcome)| outcome.is_clean()) {
            0
        } else {
            1
        }
    }

    pub fn outcome(&self, name: &str) -> Option<&StepOutcome> {
        self.steps
            .iter()
            .find(|(step, _)| step == name)
            .map(|(_, outcome)| outcome)
    }
}

/// 关闭协调器：严格按注册顺序执行，每一步受 step_timeout 约束
pub struct TeardownCoordinator {
    steps: Vec<Box<dyn TeardownStep>>,
    step_timeout: Duration,
}

impl TeardownCoordinator {
    pub fn new(step_timeout: Duration) -> Self {
        Self {
            steps: Vec::new(),
            step_timeout,
        }
    }

    pub fn register<T: TeardownStep + 'static>(&mut self, step: T) {
        self.steps.push(Box::new(step));
    }

    pub async fn run_all(self) -> TeardownReport {
        tracing::info!("Running {} teardown steps...", self.steps.len());

        let mut report = TeardownReport::default();
        for mut step in self.steps {
            let name = step.name().to_string();
            let outcome = match tokio::time::timeout(self.step_timeout, step.run()).await {
                Ok(outcome) => outcome,
                Err(_) => StepOutcome::Failed(format!(
                    "timed out after {:.1}s",
                    self.step_timeout.as_secs_f64()
                )),
            };
            match &outcome {
                StepOutcome::Clean => tracing::info!("Teardown step '{}' completed cleanly", name),
                StepOutcome::Forced => tracing::warn!("Teardown step '{}' required a forced kill", name),
                StepOutcome::Failed(reason) => {
                    tracing::warn!("Teardown step '{}' failed: {}", name, reason)
                }
            }
            report.steps.push((name, outcome));
        }

        tracing::info!("All teardown steps finished");
        report
    }
}
