//! Orchestrator：实验生命周期监管
//!
//! 负责：启动 mailbox、World、Agent 子进程（以及可选的奖励记录任务），
//! 以固定频率检查 control，执行墙钟超时，最后按固定顺序做有界关闭并给出退出码。
//! Orchestrator 不参与每一步的数据交换，只读写 control。

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, SystemTime};

use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::agent::build_policy;
use crate::config::AppConfig;
use crate::core::pacemaker::Pacemaker;
use crate::core::protocol::{ControlSignal, CONTROL};
use crate::core::shutdown::{StepOutcome, TeardownCoordinator, TeardownReport, TeardownStep};
use crate::core::BenchError;
use crate::mailbox::MailboxClient;
use crate::results::{ResultStore, RewardLogger};
use crate::world::build_environment;

/// 落盘配置的文件名前缀（位于系统临时目录）
pub const STAGED_CONFIG_PREFIX: &str = "tandem-run-";

/// 残留配置文件超过该时长才会被清理，避免误删并行运行中的文件
const STALE_AFTER: Duration = Duration::from_secs(3600);

/// 子进程启动命令
#[derive(Debug, Clone)]
pub struct ChildCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl ChildCommand {
    pub fn new(program: impl Into<PathBuf>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    fn spawn(&self, name: &str) -> Result<Child, BenchError> {
        tracing::debug!(name, program = %self.program.display(), args = ?self.args, "Spawning child");
        Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BenchError::Process {
                name: name.to_string(),
                message: format!("spawn {}: {e}", self.program.display()),
            })
    }
}

/// 三个子进程的启动方式
#[derive(Debug, Clone)]
pub struct Launch {
    pub mailbox: ChildCommand,
    pub world: ChildCommand,
    pub agent: ChildCommand,
}

impl Launch {
    /// 用同一个可执行文件的子命令启动各进程，并共享同一份配置文件
    pub fn for_executable(exe: &Path, config_path: &Path) -> Self {
        let config = config_path.to_string_lossy().to_string();
        let role = |cmd: &str| ChildCommand::new(exe, &["--config", &config, cmd]);
        Self {
            mailbox: role("serve"),
            world: role("world"),
            agent: role("agent"),
        }
    }

    pub fn current_exe(config_path: &Path) -> Result<Self, BenchError> {
        let exe = std::env::current_exe().map_err(|e| BenchError::Process {
            name: "orchestrator".into(),
            message: format!("locate current executable: {e}"),
        })?;
        Ok(Self::for_executable(&exe, config_path))
    }
}

/// 把解析后的配置写入临时目录，返回路径
pub fn stage_config(cfg: &AppConfig) -> Result<PathBuf, BenchError> {
    let path = std::env::temp_dir().join(format!("{STAGED_CONFIG_PREFIX}{}.toml", uuid::Uuid::new_v4()));
    cfg.write_to(&path)?;
    Ok(path)
}

/// 清理 dir 下早于 max_age 的残留配置文件，返回删除数量
pub fn sweep_stale_files(dir: &Path, max_age: Duration) -> usize {
    let pattern = dir.join(format!("{STAGED_CONFIG_PREFIX}*.toml"));
    let Ok(entries) = glob::glob(&pattern.to_string_lossy()) else {
        return 0;
    };

    let now = SystemTime::now();
    let mut removed = 0;
    for path in entries.flatten() {
        let age = std::fs::metadata(&path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .unwrap_or_default();
        if age >= max_age && std::fs::remove_file(&path).is_ok() {
            tracing::debug!(path = %path.display(), "Removed stale staged config");
            removed += 1;
        }
    }
    removed
}

/// 监管阶段如何结束
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// control 上出现 terminated / shutdown
    Completed,
    /// 超时，由 Orchestrator 注入 terminated
    TimedOut,
    /// World 或 Agent 提前以失败状态退出，由 Orchestrator 注入 terminated
    ParticipantFailed,
    /// 结果记录或 World / Agent 未能启动，由 Orchestrator 注入 terminated
    StartupFailed,
    /// 与 mailbox 的连接意外断开
    MailboxLost,
}

impl RunOutcome {
    /// 本身即意味着失败的结局，不论关闭是否干净
    fn is_failure(self) -> bool {
        matches!(
            self,
            RunOutcome::ParticipantFailed | RunOutcome::StartupFailed | RunOutcome::MailboxLost
        )
    }
}

/// 一次运行的结果
#[derive(Debug)]
pub struct BenchReport {
    pub outcome: RunOutcome,
    pub exit_code: i32,
    pub teardown: TeardownReport,
    pub elapsed: Duration,
}

/// mailbox 之后启动的组件；启动到一半失败时只有部分存在
#[derive(Default)]
struct Participants {
    logger: Option<JoinHandle<anyhow::Result<u64>>>,
    world: Option<Child>,
    agent: Option<Child>,
}

pub struct Orchestrator {
    config: AppConfig,
    launch: Launch,
    staged_config: Option<PathBuf>,
}

impl Orchestrator {
    pub fn new(config: AppConfig, launch: Launch) -> Self {
        Self {
            config,
            launch,
            staged_config: None,
        }
    }

    /// 关闭时一并删除的落盘配置
    pub fn with_staged_config(mut self, path: PathBuf) -> Self {
        self.staged_config = Some(path);
        self
    }

    /// mailbox 启动之后的任何失败都会走完整的关闭流程并体现在报告里；
    /// 只有 mailbox 本身无法启动或连接时返回 Err
    pub async fn run(self) -> Result<BenchReport, BenchError> {
        let result = self.run_supervised().await;
        if result.is_err() {
            if let Some(path) = &self.staged_config {
                remove_staged_config(path);
            }
        }
        result
    }

    async fn run_supervised(&self) -> Result<BenchReport, BenchError> {
        let started = Instant::now();
        let bench = &self.config.bench;
        let step_timeout = Duration::from_millis(bench.shutdown_timeout_ms);
        let timeout = bench
            .timeout_secs
            .map(|secs| {
                Duration::try_from_secs_f64(secs)
                    .map_err(|e| BenchError::Config(format!("bench.timeout_secs = {secs}: {e}")))
            })
            .transpose()?;
        let pacemaker = Pacemaker::new(bench.health_check_hz)?;

        let world_name = build_environment(&self.config.world)?.name().to_string();
        let shape = build_environment(&self.config.world)?.shape();
        let agent_name = build_policy(&self.config.agent, shape)?.name().to_string();
        tracing::info!(world = %world_name, agent = %agent_name, "Starting bench run");

        let mut mailbox = self.launch.mailbox.spawn("mailbox")?;
        tokio::time::sleep(Duration::from_millis(bench.warmup_ms)).await;

        let mut control = match MailboxClient::connect(&self.config.mailbox.host, self.config.mailbox.port).await {
            Ok(client) => client,
            Err(e) => {
                let _ = mailbox.kill().await;
                return Err(e.into());
            }
        };

        let mut participants = Participants::default();
        let start = self.start_participants(&mut participants, &agent_name, &world_name).await;
        let outcome = match (start, participants.world.as_mut(), participants.agent.as_mut()) {
            (Ok(()), Some(world), Some(agent)) => {
                self.supervise(pacemaker, timeout, &mut control, world, agent).await
            }
            (start, _, _) => {
                if let Err(e) = start {
                    tracing::error!("Failed to start run: {}", e);
                }
                if let Err(e) = control.put(CONTROL, ControlSignal::Terminated.as_str()).await {
                    tracing::warn!("Could not send terminated: {}", e);
                }
                RunOutcome::StartupFailed
            }
        };
        tracing::info!(?outcome, "Supervision finished, tearing down");

        let mut teardown = TeardownCoordinator::new(step_timeout + Duration::from_secs(2));
        if let Some(handle) = participants.logger {
            teardown.register(LoggerStep {
                handle: Some(handle),
                timeout: step_timeout,
            });
        }
        if let Some(world) = participants.world {
            teardown.register(ParticipantStep::new("world", world, step_timeout));
        }
        if let Some(agent) = participants.agent {
            teardown.register(ParticipantStep::new("agent", agent, step_timeout));
        }
        teardown.register(MailboxStep {
            control,
            child: mailbox,
            timeout: step_timeout,
        });
        if let Some(path) = self.staged_config.clone() {
            teardown.register(SweepStep { path });
        }
        let teardown = teardown.run_all().await;

        let exit_code = if outcome.is_failure() { 1 } else { teardown.exit_code() };
        let elapsed = started.elapsed();
        tracing::info!(?outcome, exit_code, elapsed_secs = elapsed.as_secs_f64(), "Bench run finished");

        Ok(BenchReport {
            outcome,
            exit_code,
            teardown,
            elapsed,
        })
    }

    /// 依次启动结果记录、World、Agent；已启动的部分留在 participants 中等待关闭
    async fn start_participants(
        &self,
        participants: &mut Participants,
        agent_name: &str,
        world_name: &str,
    ) -> Result<(), BenchError> {
        let bench = &self.config.bench;
        if bench.log_to_db {
            let store = ResultStore::open(&bench.log_directory, &bench.db_name).map_err(|e| {
                BenchError::Process {
                    name: "logger".into(),
                    message: format!("{e:#}"),
                }
            })?;
            let client = MailboxClient::connect(&self.config.mailbox.host, self.config.mailbox.port).await?;
            let logger = RewardLogger::new(client, store, bench.logging_hz, agent_name, world_name);
            participants.logger = Some(tokio::spawn(logger.run()));
        }

        participants.world = Some(self.launch.world.spawn("world")?);
        participants.agent = Some(self.launch.agent.spawn("agent")?);
        Ok(())
    }

    /// 按 health_check_hz 检查 control，直到完成、超时、参与者失败或 mailbox 断开
    async fn supervise(
        &self,
        mut pacemaker: Pacemaker,
        timeout: Option<Duration>,
        control: &mut MailboxClient,
        world: &mut Child,
        agent: &mut Child,
    ) -> RunOutcome {
        let run_start = Instant::now();

        loop {
            pacemaker.beat().await;

            // control 以 FIFO 方式投递给每个连接，读空才能看到最新状态
            loop {
                let message = match control.get(CONTROL).await {
                    Ok(message) => message,
                    Err(e) => {
                        tracing::error!("Mailbox connection lost: {}", e);
                        return RunOutcome::MailboxLost;
                    }
                };
                if message.is_empty() {
                    break;
                }
                match message.parse::<ControlSignal>() {
                    Ok(signal) if signal.ends_run() => {
                        tracing::info!(%signal, "Run ended by control signal");
                        return RunOutcome::Completed;
                    }
                    Ok(signal) => tracing::debug!(%signal, "Control"),
                    Err(e) => tracing::warn!("Ignoring control message: {}", e),
                }
            }

            if let Some(timeout) = timeout {
                if run_start.elapsed() > timeout {
                    tracing::warn!("Run timed out after {:.1}s, sending terminated", timeout.as_secs_f64());
                    return send_terminated(control, RunOutcome::TimedOut).await;
                }
            }

            for (name, child) in [("world", &mut *world), ("agent", &mut *agent)] {
                if let Ok(Some(status)) = child.try_wait() {
                    if !status.success() {
                        tracing::error!(name, %status, "Participant exited with failure, sending terminated");
                        return send_terminated(control, RunOutcome::ParticipantFailed).await;
                    }
                }
            }
        }
    }
}

/// 注入 terminated；写入失败说明 mailbox 已不可用
async fn send_terminated(control: &mut MailboxClient, outcome: RunOutcome) -> RunOutcome {
    match control.put(CONTROL, ControlSignal::Terminated.as_str()).await {
        Ok(()) => outcome,
        Err(e) => {
            tracing::error!("Mailbox connection lost while sending terminated: {}", e);
            RunOutcome::MailboxLost
        }
    }
}

fn remove_staged_config(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), "Could not remove staged config: {}", e),
    }
}

/// 结束子进程：限时等待，超时则强制终止
async fn wait_or_kill(name: &str, child: &mut Child, timeout: Duration) -> StepOutcome {
    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) if status.success() => StepOutcome::Clean,
        Ok(Ok(status)) => StepOutcome::Failed(format!("exited with {status}")),
        Ok(Err(e)) => StepOutcome::Failed(format!("wait failed: {e}")),
        Err(_) => {
            tracing::warn!("Doing a hard shutdown on {}", name);
            if let Err(e) = child.kill().await {
                return StepOutcome::Failed(format!("kill failed: {e}"));
            }
            StepOutcome::Forced
        }
    }
}

struct LoggerStep {
    handle: Option<JoinHandle<anyhow::Result<u64>>>,
    timeout: Duration,
}

#[async_trait::async_trait]
impl TeardownStep for LoggerStep {
    async fn run(&mut self) -> StepOutcome {
        let Some(mut handle) = self.handle.take() else {
            return StepOutcome::Clean;
        };
        match tokio::time::timeout(self.timeout, &mut handle).await {
            Ok(Ok(Ok(records))) => {
                tracing::info!(records, "Reward logger joined");
                StepOutcome::Clean
            }
            Ok(Ok(Err(e))) => StepOutcome::Failed(format!("{e:#}")),
            Ok(Err(e)) => StepOutcome::Failed(format!("logger task panicked: {e}")),
            Err(_) => {
                tracing::warn!("Logging didn't shut down cleanly");
                handle.abort();
                StepOutcome::Forced
            }
        }
    }

    fn name(&self) -> &str {
        "logger"
    }
}

struct ParticipantStep {
    name: &'static str,
    child: Child,
    timeout: Duration,
}

impl ParticipantStep {
    fn new(name: &'static str, child: Child, timeout: Duration) -> Self {
        Self { name, child, timeout }
    }
}

#[async_trait::async_trait]
impl TeardownStep for ParticipantStep {
    async fn run(&mut self) -> StepOutcome {
        wait_or_kill(self.name, &mut self.child, self.timeout).await
    }

    fn name(&self) -> &str {
        self.name
    }
}

/// 先请求 mailbox 自行关闭，限时等待后强制终止
struct MailboxStep {
    control: MailboxClient,
    child: Child,
    timeout: Duration,
}

#[async_trait::async_trait]
impl TeardownStep for MailboxStep {
    async fn run(&mut self) -> StepOutcome {
        if let Err(e) = self.control.shutdown_server().await {
            tracing::warn!("Polite mailbox shutdown failed: {}", e);
        }
        self.control.close().await;
        wait_or_kill("mailbox", &mut self.child, self.timeout).await
    }

    fn name(&self) -> &str {
        "mailbox"
    }
}

/// 删除本次运行落盘的配置
struct SweepStep {
    path: PathBuf,
}

#[async_trait::async_trait]
impl TeardownStep for SweepStep {
    async fn run(&mut self) -> StepOutcome {
        remove_staged_config(&self.path);
        StepOutcome::Clean
    }

    fn name(&self) -> &str {
        "sweep"
    }
}

/// `tandem run` 入口：校验配置、清理残留、落盘配置、以当前可执行文件启动各角色
pub async fn run_bench(cfg: AppConfig) -> anyhow::Result<BenchReport> {
    use anyhow::Context;

    cfg.validate()?;
    let removed = sweep_stale_files(&std::env::temp_dir(), STALE_AFTER);
    if removed > 0 {
        tracing::info!(removed, "Swept stale staged configs from earlier runs");
    }

    let staged = stage_config(&cfg).context("stage run config")?;
    let launch = Launch::current_exe(&staged)?;
    let report = Orchestrator::new(cfg, launch)
        .with_staged_config(staged)
        .run()
        .await?;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launch_uses_subcommands() {
        let launch = Launch::for_executable(Path::new("/opt/tandem"), Path::new("/tmp/run.toml"));
        assert_eq!(launch.world.program, PathBuf::from("/opt/tandem"));
        assert_eq!(launch.world.args, vec!["--config", "/tmp/run.toml", "world"]);
        assert_eq!(launch.mailbox.args.last().map(String::as_str), Some("serve"));
        assert_eq!(launch.agent.args.last().map(String::as_str), Some("agent"));
    }

    #[test]
    fn test_stage_config_round_trips() {
        let mut cfg = AppConfig::default();
        cfg.world.n_loop_steps = 7;
        let path = stage_config(&cfg).unwrap();
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with(STAGED_CONFIG_PREFIX) && name.ends_with(".toml"));

        let loaded = crate::config::load_config(Some(path.clone())).unwrap();
        assert_eq!(loaded.world.n_loop_steps, 7);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_sweep_only_touches_staged_files() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("tandem-run-a.toml"), "").unwrap();
        std::fs::write(dir.path().join("tandem-run-b.toml"), "").unwrap();
        std::fs::write(dir.path().join("other.toml"), "").unwrap();

        assert_eq!(sweep_stale_files(dir.path(), Duration::from_secs(3600)), 0);
        assert_eq!(sweep_stale_files(dir.path(), Duration::ZERO), 2);
        assert!(dir.path().join("other.toml").exists());
        assert!(!dir.path().join("tandem-run-a.toml").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_wait_or_kill_escalates() {
        let mut child = Command::new("sleep").arg("30").kill_on_drop(true).spawn().unwrap();
        let start = std::time::Instant::now();
        let outcome = wait_or_kill("sleeper", &mut child, Duration::from_millis(100)).await;
        assert_eq!(outcome, StepOutcome::Forced);
        assert!(start.elapsed() < Duration::from_secs(5));

        let mut child = Command::new("true").spawn().unwrap();
        assert_eq!(
            wait_or_kill("quick", &mut child, Duration::from_secs(2)).await,
            StepOutcome::Clean
        );

        let mut child = Command::new("false").spawn().unwrap();
        assert!(matches!(
            wait_or_kill("failing", &mut child, Duration::from_secs(2)).await,
            StepOutcome::Failed(_)
        ));
    }
}
