//! Tandem - 实时 Agent / World 实验台
//!
//! 模块划分：
//! - **agent**: 决策策略与 Agent 轮询循环
//! - **config**: 实验配置加载（TOML + 环境变量）
//! - **core**: 错误、交互协议、节拍器、关闭处理、Orchestrator
//! - **mailbox**: 按 topic 寻址的内存消息服务（服务端 + 客户端）
//! - **results**: 奖励记录（SQLite）
//! - **world**: 环境模型与 World 交互循环

pub mod agent;
pub mod config;
pub mod core;
pub mod mailbox;
pub mod observability;
pub mod results;
pub mod world;
