// Exponential backoff для очереди, переподключения и key directory

use crate::config::Config;
use std::time::Duration;

/// Политика повторов для операций очереди
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial: Duration,
    pub max: Duration,
    /// После стольких попыток операция помечается failed
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            initial: Duration::from_millis(config.retry_initial_ms),
            max: Duration::from_millis(config.retry_max_ms),
            max_attempts: config.max_send_attempts,
        }
    }

    /// Задержка после `attempts` неудачных попыток: initial * 2^(attempts-1), не больше max
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(31);
        self.initial
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max)
            .min(self.max)
    }

    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(Config::global())
    }
}

/// Состояние backoff для повторяющихся попыток (переподключение, fetch)
#[derive(Debug, Clone)]
pub struct Backoff {
    /// Количество попыток
    attempts: u32,
    /// Максимальное количество попыток (0 = бесконечно)
    max_attempts: u32,
    current_delay: Duration,
    initial_delay: Duration,
    max_delay: Duration,
}

impl Backoff {
    pub fn new(initial_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            attempts: 0,
            max_attempts,
            current_delay: initial_delay,
            initial_delay,
            max_delay,
        }
    }

    /// Backoff переподключения из `Config`
    pub fn reconnect(config: &Config) -> Self {
        Self::new(
            Duration::from_millis(config.reconnect_initial_ms),
            Duration::from_millis(config.reconnect_max_ms),
            0,
        )
    }

    /// Вычислить следующую задержку с exponential backoff
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current_delay;

        // Exponential backoff: удваиваем задержку
        self.current_delay = (self.current_delay * 2).min(self.max_delay);
        self.attempts += 1;

        delay
    }

    /// Сбросить счётчик попыток
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.current_delay = self.initial_delay;
    }

    /// Проверить, можно ли продолжать попытки
    pub fn can_retry(&self) -> bool {
        self.max_attempts == 0 || self.attempts < self.max_attempts
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}
