//! 确定性参考环境：13 个传感器、5 个动作、3 个奖励通道
//!
//! 行为与时间无关，方便在端到端测试里校验具体数值。
//! 动作索引取第一个非零分量（全零时视为 1）；索引小于奖励通道数时，该通道本步缺席。

use super::{Environment, Observation, Resettable, Sensing, Shape, Steppable};

const N_SENSORS: usize = 13;
const N_ACTIONS: usize = 5;
const N_REWARDS: usize = 3;

#[derive(Debug, Default)]
pub struct ReferenceWorld {
    actions: Vec<f64>,
    i_action: usize,
    /// 回合内的交互步序号
    tick: u64,
}

impl ReferenceWorld {
    pub fn new() -> Self {
        let mut world = Self::default();
        world.reset();
        world
    }
}

impl Resettable for ReferenceWorld {
    fn reset(&mut self) {
        self.actions = vec![0.0; N_ACTIONS];
        self.i_action = 1;
        self.tick = 0;
    }
}

impl Steppable for ReferenceWorld {
    fn advance_substep(&mut self, actions: &[f64]) {
        self.actions = actions.to_vec();
        self.i_action = actions.iter().position(|&a| a != 0.0).unwrap_or(1);
    }
}

impl Sensing for ReferenceWorld {
    fn observe(&mut self) -> Observation {
        let mut sensors = vec![0.0; N_SENSORS];
        for (i, &a) in self.actions.iter().take(N_ACTIONS).enumerate() {
            sensors[i] = a;
            sensors[N_ACTIONS + i] = 0.8 * a - 0.3;
        }

        let i = self.i_action as f64;
        let mut rewards = vec![
            Some(i / 10.0),
            Some(-i / 2.0),
            Some(i / (self.tick as f64 + 1.0)),
        ];
        if self.i_action < N_REWARDS {
            rewards[self.i_action] = None;
        }

        self.tick += 1;
        Observation { sensors, rewards }
    }
}

impl Environment for ReferenceWorld {
    fn name(&self) -> &str {
        "Reference world"
    }

    fn shape(&self) -> Shape {
        Shape {
            n_sensors: N_SENSORS,
            n_actions: N_ACTIONS,
            n_rewards: N_REWARDS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_action_defaults_to_index_one() {
        let mut world = ReferenceWorld::new();
        world.advance_substep(&[0.0; N_ACTIONS]);
        let obs = world.observe();
        assert_eq!(obs.sensors.len(), N_SENSORS);
        assert_eq!(obs.rewards, vec![Some(0.1), None, Some(1.0)]);
        assert_eq!(obs.sensors[5], -0.3);
    }

    #[test]
    fn test_chosen_action_drives_sensors_and_rewards() {
        let mut world = ReferenceWorld::new();
        for _ in 0..7 {
            world.observe();
        }
        world.advance_substep(&[0.0, 0.0, 0.0, 1.0, 0.0]);
        let obs = world.observe();

        assert_eq!(obs.sensors[3], 1.0);
        assert!((obs.sensors[8] - 0.5).abs() < 1e-12);
        assert!((obs.rewards[0].unwrap() - 0.3).abs() < 1e-12);
        assert_eq!(obs.rewards[1], Some(-1.5));
        assert_eq!(obs.rewards[2], Some(0.375));
    }

    #[test]
    fn test_first_action_silences_its_channel() {
        let mut world = ReferenceWorld::new();
        world.advance_substep(&[1.0, 0.0, 0.0, 0.0, 0.0]);
        let obs = world.observe();
        assert_eq!(obs.rewards[0], None);
        assert_eq!(obs.rewards[1], Some(0.0));
    }

    #[test]
    fn test_reset_restarts_tick() {
        let mut world = ReferenceWorld::new();
        world.advance_substep(&[0.0, 0.0, 0.0, 0.0, 1.0]);
        world.observe();
        world.observe();
        world.reset();
        world.advance_substep(&[0.0, 0.0, 0.0, 0.0, 1.0]);
        assert_eq!(world.observe().rewards[2], Some(4.0));
    }
}
