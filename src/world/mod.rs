//! World：环境模型与 World 交互循环
//!
//! 环境按能力拆成三个 trait（可重置、可步进、可感知），循环只依赖 `Environment` 这个组合接口，
//! 不接触具体环境的内部状态。

mod bandit;
mod pendulum;
mod reference;
mod world_loop;

use rand::rngs::StdRng;
use rand::SeedableRng;

pub use bandit::{ContextualBandit, StationaryBandit};
pub use pendulum::Pendulum;
pub use reference::ReferenceWorld;
pub use world_loop::{run_world_process, WorldLoop, WorldSummary, WorldTiming};

use crate::config::WorldSection;
use crate::core::BenchError;

/// 传感器 / 动作 / 奖励向量的维度，一次运行内固定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shape {
    pub n_sensors: usize,
    pub n_actions: usize,
    pub n_rewards: usize,
}

/// 一次感知的结果
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub sensors: Vec<f64>,
    /// None 表示该奖励通道本步未触发
    pub rewards: Vec<Option<f64>>,
}

pub trait Resettable {
    /// 回到初始状态
    fn reset(&mut self);
}

pub trait Steppable {
    /// 用给定动作推进一个子步
    fn advance_substep(&mut self, actions: &[f64]);
}

pub trait Sensing {
    /// 根据最后一个子步的状态计算观测
    fn observe(&mut self) -> Observation;
}

pub trait Environment: Resettable + Steppable + Sensing + Send {
    fn name(&self) -> &str;

    fn shape(&self) -> Shape;
}

pub(crate) fn seeded_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    }
}

/// 按 `[world] kind` 构造环境
pub fn build_environment(section: &WorldSection) -> Result<Box<dyn Environment>, BenchError> {
    let timing = WorldTiming::from_section(section)?;
    let env: Box<dyn Environment> = match section.kind.as_str() {
        "reference" => Box::new(ReferenceWorld::new()),
        "stationary_bandit" => Box::new(StationaryBandit::new(section.seed)),
        "contextual_bandit" => Box::new(ContextualBandit::new(section.seed)),
        "pendulum" => Box::new(Pendulum::new(timing.world_steps_per_second)),
        other => return Err(BenchError::UnknownWorld(other.to_string())),
    };
    Ok(env)
}
