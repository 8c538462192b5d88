use std::time::Duration;

/// 重试策略
#[derive(Debug, Clone, PartialEq)]
pub enum RetryStrategy {
    /// 固定延迟
    Fixed(Duration),
    /// 指数退避
    Exponential {
        initial: Duration,
        multiplier: f64,
        max_delay: Duration,
    },
}

impl RetryStrategy {
    /// 计算第 n 次失败后的延迟（n 从 1 开始）
    pub fn get_delay(&self, attempt: u32) -> Duration {
        match self {
            RetryStrategy::Fixed(delay) => *delay,
            RetryStrategy::Exponential { initial, multiplier, max_delay } => {
                let exponent = attempt.saturating_sub(1).min(64) as i32;
                let delay = initial.as_secs_f64() * multiplier.powi(exponent);
                if !delay.is_finite() || delay >= max_delay.as_secs_f64() {
                    return *max_delay;
                }
                Duration::from_secs_f64(delay.max(0.0))
            }
        }
    }
}

/// 失败任务的重试策略
///
/// 任务累计失败 `max_attempts` 次后不再重试，转入死信。
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// 最大尝试次数
    pub max_attempts: u32,
    /// 退避策略
    pub strategy: RetryStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            strategy: RetryStrategy::Exponential {
                initial: Duration::from_secs(1),
                multiplier: 2.0,
                max_delay: Duration::from_secs(300),
            },
        }
    }
}

impl RetryPolicy {
    /// 失败后立即重试，测试用
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            strategy: RetryStrategy::Fixed(Duration::ZERO),
        }
    }

    /// 已失败 `attempts` 次后是否还能再试
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts.max(1)
    }

    pub fn backoff(&self, attempts: u32) -> Duration {
        self.strategy.get_delay(attempts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_then_capped() {
        let strategy = RetryStrategy::Exponential {
            initial: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(300),
        };
        assert_eq!(strategy.get_delay(1), Duration::from_secs(1));
        assert_eq!(strategy.get_delay(2), Duration::from_secs(2));
        assert_eq!(strategy.get_delay(3), Duration::from_secs(4));
        assert_eq!(strategy.get_delay(9), Duration::from_secs(256));
        assert_eq!(strategy.get_delay(10), Duration::from_secs(300));
        assert_eq!(strategy.get_delay(u32::MAX), Duration::from_secs(300));
    }

    #[test]
    fn test_policy_ceiling() {
        let policy = RetryPolicy::immediate(3);
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert_eq!(policy.backoff(2), Duration::ZERO);

        // 0 视为 1，至少执行一次
        assert!(!RetryPolicy::immediate(0).should_retry(1));
    }
}
