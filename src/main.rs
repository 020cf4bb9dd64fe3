//! Tandem - 实时 Agent / World 实验台
//!
//! 入口：初始化日志、加载配置，并按子命令运行对应角色。
//! `run` 是 Orchestrator，会以 `serve` / `world` / `agent` 子命令重新启动自身作为子进程。

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::Instrument;

use tandem::config::load_config;
use tandem::{agent, mailbox, observability, world};

#[derive(Parser)]
#[command(name = "tandem")]
#[command(about = "Real-time agent/world experiment bench")]
struct Cli {
    /// 配置文件（TOML），可再用 TANDEM__SECTION__KEY 环境变量覆盖
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a full experiment: mailbox, world and agent under supervision
    Run {
        /// Wall-clock timeout in seconds (overrides bench.timeout_secs)
        #[arg(long)]
        timeout: Option<f64>,
        /// Record rewards to the SQLite results database
        #[arg(long)]
        log_to_db: bool,
    },
    /// Serve the mailbox
    Serve,
    /// Run the world loop
    World,
    /// Run the agent loop
    Agent,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let cli = Cli::parse();
    let mut cfg = load_config(cli.config.clone()).context("Failed to load config")?;

    match cli.command {
        Commands::Run { timeout, log_to_db } => {
            if timeout.is_some() {
                cfg.bench.timeout_secs = timeout;
            }
            if log_to_db {
                cfg.bench.log_to_db = true;
            }
            let report = tandem::core::run_bench(cfg)
                .instrument(tracing::info_span!("orchestrator"))
                .await
                .context("Bench run failed")?;
            std::process::exit(report.exit_code);
        }
        Commands::Serve => {
            mailbox::serve(&cfg)
                .instrument(tracing::info_span!("mailbox"))
                .await
                .context("Mailbox failed")?;
        }
        Commands::World => {
            cfg.validate()?;
            let summary = world::run_world_process(&cfg)
                .instrument(tracing::info_span!("world"))
                .await
                .context("World loop failed")?;
            tracing::info!(?summary, "World exiting");
        }
        Commands::Agent => {
            cfg.validate()?;
            let summary = agent::run_agent_process(&cfg)
                .instrument(tracing::info_span!("agent"))
                .await
                .context("Agent loop failed")?;
            tracing::info!(?summary, "Agent exiting");
        }
    }

    Ok(())
}
