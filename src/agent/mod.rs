//! Agent：决策策略与 Agent 轮询循环
//!
//! 策略只负责「观测 → 动作」，与 mailbox 无关；循环负责轮询、回合对齐与发布。

mod agent_loop;
mod q_learning;

use rand::rngs::StdRng;
use rand::Rng;

pub use agent_loop::{run_agent_process, AgentLoop, AgentSummary};
pub use q_learning::{QLearningCuriosityPolicy, QLearningPolicy};

use crate::config::AgentSection;
use crate::core::BenchError;
use crate::world::{seeded_rng, Shape};

/// 决策策略
pub trait Policy: Send {
    fn name(&self) -> &str;

    /// 回合开始时调用
    fn reset(&mut self);

    /// 根据最新观测给出动作向量（长度固定为 n_actions）
    fn choose_action(&mut self, sensors: &[f64], rewards: &[Option<f64>]) -> Vec<f64>;
}

/// 始终输出全零动作
pub struct ZeroPolicy {
    n_actions: usize,
}

impl ZeroPolicy {
    pub fn new(n_actions: usize) -> Self {
        Self { n_actions }
    }
}

impl Policy for ZeroPolicy {
    fn name(&self) -> &str {
        "Zero agent"
    }

    fn reset(&mut self) {}

    fn choose_action(&mut self, _sensors: &[f64], _rewards: &[Option<f64>]) -> Vec<f64> {
        vec![0.0; self.n_actions]
    }
}

/// 每步均匀随机选一个动作（one-hot）
pub struct RandomPolicy {
    n_actions: usize,
    rng: StdRng,
}

impl RandomPolicy {
    pub fn new(n_actions: usize, seed: Option<u64>) -> Self {
        Self {
            n_actions,
            rng: seeded_rng(seed),
        }
    }
}

impl Policy for RandomPolicy {
    fn name(&self) -> &str {
        "Random agent"
    }

    fn reset(&mut self) {}

    fn choose_action(&mut self, _sensors: &[f64], _rewards: &[Option<f64>]) -> Vec<f64> {
        let mut actions = vec![0.0; self.n_actions];
        if self.n_actions > 0 {
            actions[self.rng.random_range(0..self.n_actions)] = 1.0;
        }
        actions
    }
}

/// 按 `[agent] kind` 构造策略；维度来自环境
pub fn build_policy(section: &AgentSection, shape: Shape) -> Result<Box<dyn Policy>, BenchError> {
    let policy: Box<dyn Policy> = match section.kind.as_str() {
        "zero" => Box::new(ZeroPolicy::new(shape.n_actions)),
        "random" => Box::new(RandomPolicy::new(shape.n_actions, section.seed)),
        "q_learning" => Box::new(QLearningPolicy::new(section, shape.n_sensors, shape.n_actions)),
        "q_learning_curiosity" => Box::new(QLearningCuriosityPolicy::new(
            section,
            shape.n_sensors,
            shape.n_actions,
        )),
        other => return Err(BenchError::UnknownAgent(other.to_string())),
    };
    Ok(policy)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHAPE: Shape = Shape {
        n_sensors: 2,
        n_actions: 4,
        n_rewards: 1,
    };

    #[test]
    fn test_zero_policy() {
        let mut policy = ZeroPolicy::new(3);
        assert_eq!(policy.choose_action(&[1.0], &[Some(1.0)]), vec![0.0; 3]);
    }

    #[test]
    fn test_random_policy_is_one_hot_and_seeded() {
        let mut a = RandomPolicy::new(4, Some(9));
        let mut b = RandomPolicy::new(4, Some(9));
        for _ in 0..20 {
            let actions = a.choose_action(&[], &[]);
            assert_eq!(actions.iter().sum::<f64>(), 1.0);
            assert_eq!(actions, b.choose_action(&[], &[]));
        }
    }

    #[test]
    fn test_build_policy() {
        for kind in ["zero", "random", "q_learning", "q_learning_curiosity"] {
            let section = AgentSection {
                kind: kind.to_string(),
                ..AgentSection::default()
            };
            let mut policy = build_policy(&section, SHAPE).unwrap();
            assert_eq!(policy.choose_action(&[0.0, 0.0], &[None]).len(), 4);
        }

        let section = AgentSection {
            kind: "oracle".to_string(),
            ..AgentSection::default()
        };
        assert!(matches!(build_policy(&section, SHAPE), Err(BenchError::UnknownAgent(_))));
    }
}
