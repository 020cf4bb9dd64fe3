//! 可观测性：每个进程启动时安装一次 tracing 订阅器
//!
//! 默认级别 info，可通过 RUST_LOG 覆盖；子进程继承 Orchestrator 的环境变量，因此级别一致。
//! 日志写到 stderr。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init();
}
