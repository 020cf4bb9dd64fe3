//! 固定频率节拍器
//!
//! 每次 `beat()` 以上一个绝对截止时间加一个周期为目标；若已超时则立即返回超出的秒数，
//! 并以当前时刻重新对齐，不做追赶式的连续快速节拍。

use std::time::Duration;

use tokio::time::Instant;

use crate::core::BenchError;

#[derive(Debug)]
pub struct Pacemaker {
    period: Duration,
    last_deadline: Option<Instant>,
}

impl Pacemaker {
    pub fn new(frequency: f64) -> Result<Self, BenchError> {
        if !(frequency.is_finite() && frequency > 0.0) {
            return Err(BenchError::InvalidRate(frequency));
        }
        // 周期必须可表示且非零
        let period = Duration::try_from_secs_f64(1.0 / frequency)
            .ok()
            .filter(|period| !period.is_zero())
            .ok_or(BenchError::InvalidRate(frequency))?;
        Ok(Self {
            period,
            last_deadline: None,
        })
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn frequency(&self) -> f64 {
        1.0 / self.period.as_secs_f64()
    }

    /// 等待下一个节拍；返回超出截止时间的秒数（按时到达时为 0）。
    /// 第一次调用只建立时间基准，立即返回。
    pub async fn beat(&mut self) -> f64 {
        let now = Instant::now();
        let Some(last) = self.last_deadline else {
            self.last_deadline = Some(now);
            return 0.0;
        };

        let deadline = last + self.period;
        if now >= deadline {
            self.last_deadline = Some(now);
            return (now - deadline).as_secs_f64();
        }

        tokio::time::sleep_until(deadline).await;
        self.last_deadline = Some(deadline);
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_bad_frequency() {
        assert!(Pacemaker::new(0.0).is_err());
        assert!(Pacemaker::new(-5.0).is_err());
        assert!(Pacemaker::new(f64::NAN).is_err());
        assert!(Pacemaker::new(f64::INFINITY).is_err());
    }

    #[test]
    fn test_rejects_unrepresentable_period() {
        assert!(matches!(Pacemaker::new(1e-30), Err(BenchError::InvalidRate(_))));
        assert!(matches!(Pacemaker::new(1e300), Err(BenchError::InvalidRate(_))));
    }

    #[test]
    fn test_period_from_frequency() {
        let pm = Pacemaker::new(10.0).unwrap();
        assert!((pm.period().as_secs_f64() - 0.1).abs() < 1e-9);
        assert!((pm.frequency() - 10.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_beats_are_paced() {
        let mut pm = Pacemaker::new(50.0).unwrap();
        let start = std::time::Instant::now();
        for _ in 0..6 {
            pm.beat().await;
        }
        // 第一拍立即返回，其后 5 个周期
        assert!(start.elapsed() >= Duration::from_millis(95));
    }

    #[tokio::test]
    async fn test_overrun_is_reported_without_catch_up() {
        let mut pm = Pacemaker::new(50.0).unwrap();
        pm.beat().await;
        tokio::time::sleep(Duration::from_millis(70)).await;

        let overrun = pm.beat().await;
        assert!(overrun >= 0.04, "overrun was {overrun}");

        // 重新对齐后，下一拍仍需等待接近一个完整周期
        let start = std::time::Instant::now();
        let next = pm.beat().await;
        assert_eq!(next, 0.0);
        assert!(start.elapsed() >= Duration::from_millis(15));
    }
}
