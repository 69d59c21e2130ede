use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::record::{TransferRecord, TransferStatus};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_MAX_QUEUE_SIZE: usize = 1000;

// A zero `base_delay` makes a failed record eligible again on the next drain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::ZERO,
            max_delay: Duration::from_secs(15 * 60),
            multiplier: 2,
        }
    }
}

impl RetryPolicy {
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }

    pub fn delay_after(&self, attempts: u32) -> Duration {
        if attempts == 0 {
            return Duration::ZERO;
        }
        let factor = self.multiplier.max(1).saturating_pow(attempts - 1);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    pub fn is_due<P>(&self, record: &TransferRecord<P>, now: DateTime<Utc>) -> bool {
        match record.status {
            TransferStatus::Pending => true,
            TransferStatus::Failed => {
                if self.is_exhausted(record.attempts) {
                    return false;
                }
                let Some(last) = record.last_attempt_at else {
                    return true;
                };
                let elapsed = (now - last).to_std().unwrap_or_default();
                elapsed >= self.delay_after(record.attempts)
            }
            TransferStatus::InFlight | TransferStatus::Completed => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineConfig {
    pub retry: RetryPolicy,
    pub max_queue_size: usize,
    pub start_online: bool,
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
            start_online: true,
            event_capacity: 256,
        }
    }
}
