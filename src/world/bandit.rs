//! 多臂老虎机环境
//!
//! - StationaryBandit：5 个臂，赔付与命中率固定，无传感器
//! - ContextualBandit：4 个臂，每步打乱顺序，用 one-hot 传感器报告当前顺序
//!
//! 奖励通道与动作一一对应；未拉动的臂本步奖励缺席，拉动但未命中为 0。

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;

use super::{seeded_rng, Environment, Observation, Resettable, Sensing, Shape, Steppable};

const STATIONARY_PAYOUTS: [f64; 5] = [150.0, 200.0, 280.0, 320.0, 500.0];
const STATIONARY_HIT_RATES: [f64; 5] = [0.6, 0.5, 0.4, 0.3, 0.2];

const CONTEXTUAL_PAYOUTS: [f64; 4] = [150.0, 200.0, 280.0, 320.0];
const CONTEXTUAL_HIT_RATES: [f64; 4] = [0.3, 0.25, 0.4, 0.15];

fn pull(rng: &mut StdRng, action: f64, payout: f64, hit_rate: f64) -> Option<f64> {
    if action == 0.0 {
        return None;
    }
    if rng.random::<f64>() < hit_rate {
        Some(action * payout)
    } else {
        Some(0.0)
    }
}

pub struct StationaryBandit {
    rng: StdRng,
    rewards: Vec<Option<f64>>,
}

impl StationaryBandit {
    pub fn new(seed: Option<u64>) -> Self {
        Self {
            rng: seeded_rng(seed),
            rewards: vec![None; STATIONARY_PAYOUTS.len()],
        }
    }
}

impl Resettable for StationaryBandit {
    fn reset(&mut self) {
        self.rewards = vec![None; STATIONARY_PAYOUTS.len()];
    }
}

impl Steppable for StationaryBandit {
    fn advance_substep(&mut self, actions: &[f64]) {
        for (i, reward) in self.rewards.iter_mut().enumerate() {
            let action = actions.get(i).copied().unwrap_or(0.0);
            *reward = pull(
                &mut self.rng,
                action,
                STATIONARY_PAYOUTS[i],
                STATIONARY_HIT_RATES[i],
            );
        }
    }
}

impl Sensing for StationaryBandit {
    fn observe(&mut self) -> Observation {
        Observation {
            sensors: Vec::new(),
            rewards: self.rewards.clone(),
        }
    }
}

impl Environment for StationaryBandit {
    fn name(&self) -> &str {
        "Stationary bandit"
    }

    fn shape(&self) -> Shape {
        Shape {
            n_sensors: 0,
            n_actions: STATIONARY_PAYOUTS.len(),
            n_rewards: STATIONARY_PAYOUTS.len(),
        }
    }
}

pub struct ContextualBandit {
    rng: StdRng,
    /// order[position] = 该位置上的臂
    order: Vec<usize>,
    rewards: Vec<Option<f64>>,
}

impl ContextualBandit {
    pub fn new(seed: Option<u64>) -> Self {
        let mut bandit = Self {
            rng: seeded_rng(seed),
            order: Vec::new(),
            rewards: Vec::new(),
        };
        bandit.reset();
        bandit
    }

    fn n_arms() -> usize {
        CONTEXTUAL_PAYOUTS.len()
    }
}

impl Resettable for ContextualBandit {
    fn reset(&mut self) {
        self.order = (0..Self::n_arms()).collect();
        self.rewards = vec![None; Self::n_arms()];
    }
}

impl Steppable for ContextualBandit {
    fn advance_substep(&mut self, actions: &[f64]) {
        for (position, &arm) in self.order.iter().enumerate() {
            let action = actions.get(position).copied().unwrap_or(0.0);
            self.rewards[position] = pull(
                &mut self.rng,
                action,
                CONTEXTUAL_PAYOUTS[arm],
                CONTEXTUAL_HIT_RATES[arm],
            );
        }
    }
}

impl Sensing for ContextualBandit {
    /// 报告本步奖励，并为下一步重新打乱顺序
    fn observe(&mut self) -> Observation {
        let rewards = self.rewards.clone();

        self.order.shuffle(&mut self.rng);
        let n = Self::n_arms();
        let mut sensors = vec![0.0; n * n];
        for (position, &arm) in self.order.iter().enumerate() {
            sensors[position * n + arm] = 1.0;
        }

        Observation { sensors, rewards }
    }
}

impl Environment for ContextualBandit {
    fn name(&self) -> &str {
        "One-hot contextual bandit"
    }

    fn shape(&self) -> Shape {
        let n = Self::n_arms();
        Shape {
            n_sensors: n * n,
            n_actions: n,
            n_rewards: n,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unpulled_arms_are_absent() {
        let mut bandit = StationaryBandit::new(Some(7));
        bandit.advance_substep(&[0.0, 0.0, 1.0, 0.0, 0.0]);
        let obs = bandit.observe();
        assert!(obs.sensors.is_empty());
        assert_eq!(obs.rewards.len(), 5);
        for (i, reward) in obs.rewards.iter().enumerate() {
            if i == 2 {
                let value = reward.unwrap();
                assert!(value == 0.0 || value == 280.0);
            } else {
                assert_eq!(*reward, None);
            }
        }
    }

    #[test]
    fn test_stationary_hit_rate_is_plausible() {
        let mut bandit = StationaryBandit::new(Some(42));
        let mut hits = 0;
        for _ in 0..2000 {
            bandit.advance_substep(&[1.0, 0.0, 0.0, 0.0, 0.0]);
            if bandit.observe().rewards[0] == Some(150.0) {
                hits += 1;
            }
        }
        // 命中率 0.6
        assert!((1000..1400).contains(&hits), "hits = {hits}");
    }

    #[test]
    fn test_contextual_sensors_are_one_hot_order() {
        let mut bandit = ContextualBandit::new(Some(3));
        for _ in 0..10 {
            let obs = bandit.observe();
            assert_eq!(obs.sensors.len(), 16);
            for position in 0..4 {
                let row = &obs.sensors[position * 4..position * 4 + 4];
                assert_eq!(row.iter().sum::<f64>(), 1.0);
                let arm = row.iter().position(|&s| s == 1.0).unwrap();
                assert_eq!(bandit.order[position], arm);
            }
        }
    }

    #[test]
    fn test_contextual_payout_follows_sensed_arm() {
        let mut bandit = ContextualBandit::new(Some(11));
        for _ in 0..200 {
            bandit.observe();
            let arm = bandit.order[0];
            bandit.advance_substep(&[1.0, 0.0, 0.0, 0.0]);
            let reward = bandit.observe().rewards[0].unwrap();
            assert!(reward == 0.0 || reward == CONTEXTUAL_PAYOUTS[arm]);
        }
    }
}
