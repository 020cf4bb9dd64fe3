//! 力矩驱动的单摆
//!
//! 位置 0 为竖直向下，π 为竖直向上；奖励 1 - cos(位置)，倒立时最大。
//! 动作是对固定力矩刻度的加权，每个子步按 dt = 1 / 仿真频率做一次显式欧拉积分。

use std::f64::consts::PI;

use super::{Environment, Observation, Resettable, Sensing, Shape, Steppable};

/// 牛·米；正值为逆时针
const TORQUE_SCALE: [f64; 13] = [
    -1.0, -0.75, -0.5, -0.375, -0.25, -0.125, 0.0, 0.125, 0.25, 0.375, 0.5, 0.75, 1.0,
];
const TORQUE_GAIN: f64 = 8.0;

const MASS: f64 = 1.0;
const LENGTH: f64 = 2.0;
const GRAVITY: f64 = -9.8;
/// 轴承摩擦（牛·米·秒 / 弧度）
const FRICTION: f64 = -0.30;

#[derive(Debug)]
pub struct Pendulum {
    dt: f64,
    inertia: f64,
    position: f64,
    velocity: f64,
}

impl Pendulum {
    pub fn new(world_steps_per_second: f64) -> Self {
        Self {
            dt: 1.0 / world_steps_per_second,
            inertia: MASS * LENGTH * LENGTH / 12.0,
            position: 0.0,
            velocity: 0.0,
        }
    }

    fn applied_torque(actions: &[f64]) -> f64 {
        actions
            .iter()
            .zip(TORQUE_SCALE.iter())
            .map(|(a, scale)| a * scale * TORQUE_GAIN)
            .sum()
    }
}

impl Resettable for Pendulum {
    fn reset(&mut self) {
        self.position = 0.0;
        self.velocity = 0.0;
    }
}

impl Steppable for Pendulum {
    fn advance_substep(&mut self, actions: &[f64]) {
        let moment_arm = self.position.sin() * LENGTH / 2.0;
        let gravity_torque = MASS * GRAVITY * moment_arm;
        let friction_torque = FRICTION * self.velocity;
        let torque = Self::applied_torque(actions) + gravity_torque + friction_torque;

        self.velocity += torque * self.dt / self.inertia;
        self.position = (self.position + self.velocity * self.dt).rem_euclid(2.0 * PI);
    }
}

impl Sensing for Pendulum {
    fn observe(&mut self) -> Observation {
        Observation {
            sensors: vec![self.position, self.velocity],
            rewards: vec![Some(1.0 - self.position.cos())],
        }
    }
}

impl Environment for Pendulum {
    fn name(&self) -> &str {
        "Pendulum"
    }

    fn shape(&self) -> Shape {
        Shape {
            n_sensors: 2,
            n_actions: TORQUE_SCALE.len(),
            n_rewards: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn action(index: usize) -> Vec<f64> {
        let mut actions = vec![0.0; TORQUE_SCALE.len()];
        actions[index] = 1.0;
        actions
    }

    #[test]
    fn test_rest_is_stable() {
        let mut pendulum = Pendulum::new(64.0);
        for _ in 0..100 {
            pendulum.advance_substep(&action(6));
        }
        let obs = pendulum.observe();
        assert_eq!(obs.sensors, vec![0.0, 0.0]);
        assert_eq!(obs.rewards, vec![Some(0.0)]);
    }

    #[test]
    fn test_torque_lifts_pendulum() {
        let mut pendulum = Pendulum::new(64.0);
        for _ in 0..16 {
            pendulum.advance_substep(&action(12));
        }
        let obs = pendulum.observe();
        assert!(obs.sensors[1] > 0.0);
        assert!(obs.rewards[0].unwrap() > 0.0);
    }

    #[test]
    fn test_position_wraps() {
        let mut pendulum = Pendulum::new(64.0);
        for _ in 0..500 {
            pendulum.advance_substep(&action(0));
            let position = pendulum.observe().sensors[0];
            assert!((0.0..2.0 * PI).contains(&position));
        }
    }

    #[test]
    fn test_reset_returns_to_rest() {
        let mut pendulum = Pendulum::new(64.0);
        pendulum.advance_substep(&action(12));
        pendulum.reset();
        assert_eq!(pendulum.observe().sensors, vec![0.0, 0.0]);
    }
}
