//! 表格 Q-learning：ε-greedy 与好奇心驱动两种探索方式
//!
//! 状态键为传感器向量（按 f64 位模式精确匹配），奖励为所有已触发通道之和。
//! Q 表跨回合保留；回合重置只清空「上一步」的记忆。

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::Rng;

use super::Policy;
use crate::config::AgentSection;
use crate::core::protocol::total_reward;
use crate::world::seeded_rng;

type StateKey = Vec<u64>;

fn state_key(sensors: &[f64]) -> StateKey {
    sensors.iter().map(|s| s.to_bits()).collect()
}

pub struct QLearningPolicy {
    n_actions: usize,
    epsilon: f64,
    learning_rate: f64,
    discount_factor: f64,
    action_threshold: f64,
    q_values: HashMap<StateKey, Vec<f64>>,
    previous_sensors: Vec<f64>,
    actions: Vec<f64>,
    rng: StdRng,
}

impl QLearningPolicy {
    pub fn new(section: &AgentSection, n_sensors: usize, n_actions: usize) -> Self {
        let mut policy = Self {
            n_actions,
            epsilon: section.epsilon,
            learning_rate: section.learning_rate,
            discount_factor: section.discount_factor,
            action_threshold: section.action_threshold,
            q_values: HashMap::new(),
            previous_sensors: vec![0.0; n_sensors],
            actions: vec![0.0; n_actions],
            rng: seeded_rng(section.seed),
        };
        policy.reset();
        policy
    }

    /// 已访问过的状态数
    pub fn table_size(&self) -> usize {
        self.q_values.len()
    }

    fn values_mut(&mut self, sensors: &[f64]) -> &mut Vec<f64> {
        let n_actions = self.n_actions;
        self.q_values
            .entry(state_key(sensors))
            .or_insert_with(|| vec![0.0; n_actions])
    }

}

fn max_of(values: &[f64]) -> f64 {
    values.iter().copied().fold(f64::NEG_INFINITY, f64::max)
}

/// 最大值对应的动作，并列时随机选一个
fn argmax_random_tie(rng: &mut StdRng, values: &[f64]) -> usize {
    let max_value = max_of(values);
    let best: Vec<usize> = values
        .iter()
        .enumerate()
        .filter(|(_, v)| **v == max_value)
        .map(|(i, _)| i)
        .collect();
    best[rng.random_range(0..best.len())]
}

impl Policy for QLearningPolicy {
    fn name(&self) -> &str {
        "Epsilon-greedy Q-learning"
    }

    fn reset(&mut self) {
        self.previous_sensors.iter_mut().for_each(|s| *s = 0.0);
        self.actions = vec![0.0; self.n_actions];
    }

    fn choose_action(&mut self, sensors: &[f64], rewards: &[Option<f64>]) -> Vec<f64> {
        if self.n_actions == 0 {
            return Vec::new();
        }
        let reward = total_reward(rewards);
        let max_value = max_of(self.values_mut(sensors));

        let threshold = self.action_threshold;
        if let Some(previous_action) = self.actions.iter().position(|&a| a > threshold) {
            let (lr, gamma) = (self.learning_rate, self.discount_factor);
            let previous_sensors = self.previous_sensors.clone();
            let value = &mut self.values_mut(&previous_sensors)[previous_action];
            *value = (1.0 - lr) * *value + lr * (reward + gamma * max_value);
        }

        let i_action = if self.rng.random::<f64>() > self.epsilon {
            let values = self.values_mut(sensors).clone();
            argmax_random_tie(&mut self.rng, &values)
        } else {
            self.rng.random_range(0..self.n_actions)
        };

        self.actions = vec![0.0; self.n_actions];
        self.actions[i_action] = 1.0;
        self.previous_sensors = sensors.to_vec();
        self.actions.clone()
    }
}

/// 单个状态下每个动作的统计
#[derive(Debug, Clone)]
struct ActionStats {
    values: Vec<f64>,
    /// 该动作在此状态下被选中的次数
    counts: Vec<u32>,
    curiosities: Vec<f64>,
}

impl ActionStats {
    fn new(n_actions: usize) -> Self {
        Self {
            values: vec![0.0; n_actions],
            counts: vec![0; n_actions],
            curiosities: vec![0.0; n_actions],
        }
    }
}

/// 好奇心驱动的表格 Q-learning
///
/// 没有随机探索：每步给当前状态下的每个动作累积 `curiosity_scale / n_actions / (count² + 1)`，
/// 按 Q 值加好奇心选最大者，被选中的动作好奇心清零、计数加一。
/// 某个 (状态, 动作) 第一次得到反馈时，Q 值直接取该次奖励。
pub struct QLearningCuriosityPolicy {
    n_actions: usize,
    learning_rate: f64,
    discount_factor: f64,
    action_threshold: f64,
    curiosity_scale: f64,
    table: HashMap<StateKey, ActionStats>,
    previous_sensors: Vec<f64>,
    actions: Vec<f64>,
    rng: StdRng,
}

impl QLearningCuriosityPolicy {
    pub fn new(section: &AgentSection, n_sensors: usize, n_actions: usize) -> Self {
        Self {
            n_actions,
            learning_rate: section.learning_rate,
            discount_factor: section.discount_factor,
            action_threshold: section.action_threshold,
            curiosity_scale: section.curiosity_scale / n_actions.max(1) as f64,
            table: HashMap::new(),
            previous_sensors: vec![0.0; n_sensors],
            actions: vec![0.0; n_actions],
            rng: seeded_rng(section.seed),
        }
    }

    pub fn table_size(&self) -> usize {
        self.table.len()
    }
}

impl Policy for QLearningCuriosityPolicy {
    fn name(&self) -> &str {
        "Q-learning with curiosity"
    }

    fn reset(&mut self) {
        self.previous_sensors.iter_mut().for_each(|s| *s = 0.0);
        self.actions = vec![0.0; self.n_actions];
    }

    fn choose_action(&mut self, sensors: &[f64], rewards: &[Option<f64>]) -> Vec<f64> {
        let n_actions = self.n_actions;
        if n_actions == 0 {
            return Vec::new();
        }
        let reward = total_reward(rewards);
        let key = state_key(sensors);
        let max_value = max_of(&self.table.entry(key.clone()).or_insert_with(|| ActionStats::new(n_actions)).values);

        let threshold = self.action_threshold;
        if let Some(previous_action) = self.actions.iter().position(|&a| a > threshold) {
            let (lr, gamma) = (self.learning_rate, self.discount_factor);
            let previous = self
                .table
                .entry(state_key(&self.previous_sensors))
                .or_insert_with(|| ActionStats::new(n_actions));
            let value = &mut previous.values[previous_action];
            *value = if previous.counts[previous_action] == 1 {
                reward
            } else {
                (1.0 - lr) * *value + lr * (reward + gamma * max_value)
            };
        }

        let scale = self.curiosity_scale;
        let stats = self.table.entry(key).or_insert_with(|| ActionStats::new(n_actions));
        for (curiosity, &count) in stats.curiosities.iter_mut().zip(&stats.counts) {
            let count = f64::from(count);
            *curiosity += scale / (count * count + 1.0);
        }
        let scores: Vec<f64> = stats
            .values
            .iter()
            .zip(&stats.curiosities)
            .map(|(value, curiosity)| value + curiosity)
            .collect();
        let i_action = argmax_random_tie(&mut self.rng, &scores);
        stats.curiosities[i_action] = 0.0;
        stats.counts[i_action] += 1;

        self.actions = vec![0.0; n_actions];
        self.actions[i_action] = 1.0;
        self.previous_sensors = sensors.to_vec();
        self.actions.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn section(epsilon: f64) -> AgentSection {
        AgentSection {
            kind: "q_learning".into(),
            epsilon,
            learning_rate: 0.1,
            seed: Some(5),
            ..AgentSection::default()
        }
    }

    #[test]
    fn test_learns_rewarded_action() {
        let mut policy = QLearningPolicy::new(&section(0.3), 0, 4);
        let mut rewards = vec![None];
        for _ in 0..2000 {
            let actions = policy.choose_action(&[], &rewards);
            rewards = vec![Some(if actions[2] == 1.0 { 1.0 } else { 0.0 })];
        }

        let values = policy.q_values[&state_key(&[])].clone();
        let best = values
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap();
        assert_eq!(best, 2, "values = {values:?}");
    }

    #[test]
    fn test_table_survives_reset() {
        let mut policy = QLearningPolicy::new(&section(0.0), 1, 3);
        policy.choose_action(&[1.0], &[Some(0.0)]);
        policy.choose_action(&[2.0], &[Some(1.0)]);
        assert_eq!(policy.table_size(), 2);

        policy.reset();
        assert_eq!(policy.table_size(), 2);
        assert!(policy.actions.iter().all(|&a| a == 0.0));
    }

    #[test]
    fn test_action_is_one_hot() {
        let mut policy = QLearningPolicy::new(&section(0.5), 2, 5);
        for i in 0..50 {
            let actions = policy.choose_action(&[i as f64, 0.0], &[None, Some(1.0)]);
            assert_eq!(actions.len(), 5);
            assert_eq!(actions.iter().sum::<f64>(), 1.0);
        }
    }

    fn curiosity_section(scale: f64) -> AgentSection {
        AgentSection {
            kind: "q_learning_curiosity".into(),
            learning_rate: 0.1,
            curiosity_scale: scale,
            seed: Some(11),
            ..AgentSection::default()
        }
    }

    #[test]
    fn test_curiosity_tries_every_action_first() {
        let mut policy = QLearningCuriosityPolicy::new(&curiosity_section(1.0), 0, 4);
        let mut tried = Vec::new();
        for _ in 0..4 {
            let actions = policy.choose_action(&[], &[None]);
            assert_eq!(actions.iter().sum::<f64>(), 1.0);
            tried.push(actions.iter().position(|&a| a == 1.0).unwrap());
        }
        tried.sort_unstable();
        assert_eq!(tried, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_curiosity_first_feedback_sets_value() {
        let mut policy = QLearningCuriosityPolicy::new(&curiosity_section(1.0), 1, 2);
        let actions = policy.choose_action(&[1.0], &[None]);
        let chosen = actions.iter().position(|&a| a == 1.0).unwrap();
        policy.choose_action(&[2.0], &[Some(0.75)]);

        let stats = &policy.table[&state_key(&[1.0])];
        assert_eq!(stats.values[chosen], 0.75);
        assert_eq!(stats.counts[chosen], 1);
        assert_eq!(policy.table_size(), 2);
    }

    #[test]
    fn test_curiosity_learns_rewarded_action() {
        let mut policy = QLearningCuriosityPolicy::new(&curiosity_section(0.1), 0, 4);
        let mut rewards = vec![None];
        for _ in 0..3000 {
            let actions = policy.choose_action(&[], &rewards);
            rewards = vec![Some(if actions[1] == 1.0 { 1.0 } else { 0.0 })];
        }

        let values = policy.table[&state_key(&[])].values.clone();
        let best = values
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap();
        assert_eq!(best, 1, "values = {values:?}");
    }
}
