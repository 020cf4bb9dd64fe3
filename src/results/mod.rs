//! 结果记录：把每个交互步的总奖励写入 SQLite
//!
//! - ResultStore：`{log_directory}/{db_name}.db` 中的 rewards 表，首次使用时建表，多次运行追加写入
//! - RewardLogger：Orchestrator 侧的消费者，独立连接，只读 world_step / control

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use rusqlite::{params, Connection};

use crate::core::pacemaker::Pacemaker;
use crate::core::MailboxError;
use crate::core::protocol::{unix_timestamp, ControlSignal, StepMessage, CONTROL, WORLD_STEP};
use crate::mailbox::MailboxClient;

/// rewards 表的一行
#[derive(Debug, Clone, PartialEq)]
pub struct RewardRecord {
    pub reward: f64,
    pub step: u64,
    pub episode: u64,
    pub step_timestamp: f64,
    pub run_timestamp: f64,
    pub agent_name: String,
    pub world_name: String,
}

pub struct ResultStore {
    conn: Connection,
    path: PathBuf,
}

impl ResultStore {
    /// 打开（必要时创建）结果库
    pub fn open(log_directory: &Path, db_name: &str) -> Result<Self> {
        std::fs::create_dir_all(log_directory)
            .with_context(|| format!("Failed to create log directory: {}", log_directory.display()))?;
        let path = log_directory.join(format!("{db_name}.db"));
        let conn = Connection::open(&path)
            .with_context(|| format!("Failed to open database at: {}", path.display()))?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA busy_timeout=3000;
             CREATE TABLE IF NOT EXISTS rewards (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 reward REAL NOT NULL,
                 step INTEGER NOT NULL,
                 step_timestamp REAL NOT NULL,
                 episode INTEGER NOT NULL,
                 run_timestamp REAL NOT NULL,
                 agent_name TEXT NOT NULL,
                 world_name TEXT NOT NULL
             );",
        )
        .with_context(|| format!("Failed to initialize schema at: {}", path.display()))?;
        Ok(Self { conn, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn insert(&self, record: &RewardRecord) -> Result<()> {
        self.conn.execute(
            "INSERT INTO rewards (reward, step, step_timestamp, episode, run_timestamp, agent_name, world_name)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.reward,
                record.step as i64,
                record.step_timestamp,
                record.episode as i64,
                record.run_timestamp,
                record.agent_name,
                record.world_name,
            ],
        )?;
        Ok(())
    }

    /// 某次运行的全部记录（按写入顺序）
    pub fn records_for_run(&self, run_timestamp: f64) -> Result<Vec<RewardRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT reward, step, episode, step_timestamp, run_timestamp, agent_name, world_name
             FROM rewards WHERE run_timestamp = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![run_timestamp], |row| {
            Ok(RewardRecord {
                reward: row.get(0)?,
                step: row.get::<_, i64>(1)? as u64,
                episode: row.get::<_, i64>(2)? as u64,
                step_timestamp: row.get(3)?,
                run_timestamp: row.get(4)?,
                agent_name: row.get(5)?,
                world_name: row.get(6)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// 库中已有的运行（run_timestamp 去重，升序）
    pub fn runs(&self) -> Result<Vec<f64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT run_timestamp FROM rewards ORDER BY run_timestamp")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<f64>>>()?)
    }

    pub fn count(&self) -> Result<u64> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM rewards", [], |row| row.get(0))?;
        Ok(n as u64)
    }
}

/// 奖励记录任务
pub struct RewardLogger {
    client: MailboxClient,
    /// rusqlite 是同步的，写入放在阻塞线程池里执行
    store: Arc<Mutex<ResultStore>>,
    db_path: PathBuf,
    logging_hz: f64,
    agent_name: String,
    world_name: String,
    run_timestamp: f64,
    written: u64,
}

impl RewardLogger {
    pub fn new(
        client: MailboxClient,
        store: ResultStore,
        logging_hz: f64,
        agent_name: impl Into<String>,
        world_name: impl Into<String>,
    ) -> Self {
        Self {
            client,
            db_path: store.path().to_path_buf(),
            store: Arc::new(Mutex::new(store)),
            logging_hz,
            agent_name: agent_name.into(),
            world_name: world_name.into(),
            run_timestamp: unix_timestamp(),
            written: 0,
        }
    }

    pub fn run_timestamp(&self) -> f64 {
        self.run_timestamp
    }

    /// 每拍检查一次 control、记录一条 world_step；
    /// 收到 terminated / shutdown 后把剩余的 world_step 记完再退出，连接断开时直接退出。
    /// 返回写入的记录数
    pub async fn run(mut self) -> Result<u64> {
        let mut pacemaker = Pacemaker::new(self.logging_hz)?;

        loop {
            pacemaker.beat().await;

            match self.run_ended().await {
                Ok(false) => {}
                Ok(true) => {
                    while self.log_next().await? {}
                    break;
                }
                Err(e) if e.is_disconnect() => {
                    tracing::warn!("Mailbox connection closed, reward logging stops");
                    break;
                }
                Err(e) => return Err(e.into()),
            }

            self.log_next().await?;
        }

        self.client.close().await;
        tracing::info!(records = self.written, db = %self.db_path.display(), "Reward logging finished");
        Ok(self.written)
    }

    /// 检查 control 积压中是否已有结束运行的信号
    async fn run_ended(&mut self) -> std::result::Result<bool, MailboxError> {
        loop {
            let control = self.client.get(CONTROL).await?;
            if control.is_empty() {
                return Ok(false);
            }
            if control.parse::<ControlSignal>().is_ok_and(|signal| signal.ends_run()) {
                return Ok(true);
            }
        }
    }

    /// 消费一条 world_step 并记录；没有可读消息（或连接已断开）时返回 false
    async fn log_next(&mut self) -> Result<bool> {
        let raw = match self.client.get(WORLD_STEP).await {
            Ok(raw) => raw,
            Err(e) if e.is_disconnect() => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        if raw.is_empty() {
            return Ok(false);
        }

        let mut step = StepMessage::zeroed(0, 0);
        if let Err(e) = step.patch(&raw) {
            tracing::warn!("Skipping malformed world_step: {}", e);
            return Ok(true);
        }

        let record = RewardRecord {
            reward: step.total_reward(),
            step: step.loop_step,
            episode: step.episode,
            step_timestamp: unix_timestamp(),
            run_timestamp: self.run_timestamp,
            agent_name: self.agent_name.clone(),
            world_name: self.world_name.clone(),
        };
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || {
            let store = store
                .lock()
                .map_err(|_| anyhow::anyhow!("result store lock poisoned"))?;
            store.insert(&record)
        })
        .await
        .context("result store task failed")??;
        self.written += 1;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailbox::testing::{connect, spawn_server};

    fn record(step: u64, run_timestamp: f64) -> RewardRecord {
        RewardRecord {
            reward: step as f64 * 0.5,
            step,
            episode: 0,
            step_timestamp: 1.0,
            run_timestamp,
            agent_name: "Zero agent".into(),
            world_name: "Reference world".into(),
        }
    }

    #[test]
    fn test_store_appends_across_runs() {
        let dir = tempfile::TempDir::new().unwrap();
        {
            let store = ResultStore::open(dir.path(), "bench").unwrap();
            store.insert(&record(0, 10.0)).unwrap();
            store.insert(&record(1, 10.0)).unwrap();
        }
        let store = ResultStore::open(dir.path(), "bench").unwrap();
        store.insert(&record(0, 20.0)).unwrap();

        assert_eq!(store.count().unwrap(), 3);
        assert_eq!(store.runs().unwrap(), vec![10.0, 20.0]);
        let first = store.records_for_run(10.0).unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[1], record(1, 10.0));
    }

    #[test]
    fn test_store_creates_directory() {
        let dir = tempfile::TempDir::new().unwrap();
        let nested = dir.path().join("a").join("b");
        let store = ResultStore::open(&nested, "results").unwrap();
        assert!(store.path().ends_with("results.db"));
        assert!(store.path().exists());
    }

    #[tokio::test]
    async fn test_logger_records_until_terminated() {
        let dir = tempfile::TempDir::new().unwrap();
        let (addr, _shutdown) = spawn_server(64).await;
        let mut world = connect(addr).await;

        let store = ResultStore::open(dir.path(), "bench").unwrap();
        let logger = RewardLogger::new(connect(addr).await, store, 200.0, "Zero agent", "Reference world");
        let run_timestamp = logger.run_timestamp();
        let handle = tokio::spawn(logger.run());

        for loop_step in 0..5u64 {
            let msg = StepMessage {
                sensors: vec![],
                rewards: vec![Some(0.5), None, Some(loop_step as f64)],
                loop_step,
                episode: 0,
            };
            world.put(WORLD_STEP, &msg.encode().unwrap()).await.unwrap();
        }
        world.put(WORLD_STEP, "garbage").await.unwrap();
        world.put(CONTROL, "terminated").await.unwrap();

        let written = tokio::time::timeout(std::time::Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(written, 5);

        let store = ResultStore::open(dir.path(), "bench").unwrap();
        let records = store.records_for_run(run_timestamp).unwrap();
        assert_eq!(records.len(), 5);
        assert_eq!(records[4].step, 4);
        assert_eq!(records[4].reward, 4.5);
        assert_eq!(records[0].world_name, "Reference world");
    }

    #[tokio::test]
    async fn test_logger_stops_when_mailbox_goes_away() {
        let dir = tempfile::TempDir::new().unwrap();
        let (addr, shutdown) = spawn_server(64).await;
        let store = ResultStore::open(dir.path(), "bench").unwrap();
        let logger = RewardLogger::new(connect(addr).await, store, 200.0, "a", "w");
        let handle = tokio::spawn(logger.run());

        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        shutdown.shutdown(crate::core::shutdown::ShutdownReason::Requested);

        let written = tokio::time::timeout(std::time::Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(written, 0);
    }
}
