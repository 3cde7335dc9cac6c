//! API key pool with quota rotation and per-minute pacing.
//!
//! The provider enforces two limits per key: a requests-per-minute ceiling and
//! a daily quota. The pool paces requests by pausing for a fixed cooldown every
//! `per_minute` successful calls on the same key, and rotates to the next key
//! when the provider reports the daily quota as used up. Once every key has
//! reported quota exhaustion without an intervening success the pool is
//! exhausted for the rest of the run.

use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};

/// One API key together with its position in the pool.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    index: usize,
    key: String,
}

impl Credential {
    /// Zero-based position in the pool.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Key value sent to the provider.
    pub fn key(&self) -> &str {
        &self.key
    }
}

// Keys never end up in logs.
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("index", &self.index)
            .field("key", &"<redacted>")
            .finish()
    }
}

/// What the provider said about a request made with a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Any response without a quota signal, valid payload or not.
    Ok,
    /// The key's daily quota is used up.
    QuotaExceeded,
}

/// State of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    /// At least one key may still have quota left.
    Active,
    /// Every key reported quota exhaustion. Terminal.
    Exhausted,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("api key pool is empty")]
    Empty,

    #[error("requests-per-minute threshold must be positive")]
    InvalidThreshold,

    #[error("all {keys} api keys are at capacity")]
    Exhausted { keys: usize },
}

/// Blocking pause used for the per-minute cooldown.
pub trait Throttle: Send {
    fn pause(&self, duration: Duration);
}

/// Throttle that blocks the current thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct SleepThrottle;

impl Throttle for SleepThrottle {
    fn pause(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Rotating pool of API keys.
///
/// All mutation goes through `&mut self`, so a single owner serializes
/// acquisitions, outcome updates and cooldowns.
pub struct KeyPool {
    keys: Vec<String>,
    current: usize,
    usage_count: u32,
    quota_strikes: usize,
    state: PoolState,
    per_minute: u32,
    cooldown: Duration,
    throttle: Box<dyn Throttle>,
}

impl KeyPool {
    pub fn new(
        keys: Vec<String>,
        per_minute: u32,
        cooldown: Duration,
        throttle: Box<dyn Throttle>,
    ) -> Result<Self, PoolError> {
        if keys.is_empty() {
            return Err(PoolError::Empty);
        }
        if per_minute == 0 {
            return Err(PoolError::InvalidThreshold);
        }
        Ok(Self {
            keys,
            current: 0,
            usage_count: 0,
            quota_strikes: 0,
            state: PoolState::Active,
            per_minute,
            cooldown,
            throttle,
        })
    }

    /// Pool that sleeps the thread during cooldowns.
    pub fn with_sleep(
        keys: Vec<String>,
        per_minute: u32,
        cooldown: Duration,
    ) -> Result<Self, PoolError> {
        Self::new(keys, per_minute, cooldown, Box::new(SleepThrottle))
    }

    /// Credential to use for the next request.
    pub fn acquire(&self) -> Result<Credential, PoolError> {
        match self.state {
            PoolState::Exhausted => Err(PoolError::Exhausted {
                keys: self.keys.len(),
            }),
            PoolState::Active => Ok(Credential {
                index: self.current,
                key: self.keys[self.current].clone(),
            }),
        }
    }

    /// Feed back the provider's answer to a request made with `credential`.
    ///
    /// On `Ok` this may block for the cooldown before returning.
    pub fn record_outcome(&mut self, credential: &Credential, outcome: Outcome) {
        if self.state == PoolState::Exhausted || credential.index != self.current {
            return;
        }

        match outcome {
            Outcome::Ok => {
                self.quota_strikes = 0;
                self.usage_count += 1;
                info!(
                    key_index = self.current + 1,
                    usage = self.usage_count,
                    "successful api key use"
                );
                if self.usage_count % self.per_minute == 0 {
                    info!(
                        threshold = self.per_minute,
                        cooldown_secs = self.cooldown.as_secs(),
                        "reached requests-per-minute threshold; pausing"
                    );
                    self.throttle.pause(self.cooldown);
                }
            }
            Outcome::QuotaExceeded => {
                self.quota_strikes += 1;
                if self.quota_strikes >= self.keys.len() {
                    self.state = PoolState::Exhausted;
                    error!(keys = self.keys.len(), "all api keys at capacity");
                    return;
                }
                let next = (self.current + 1) % self.keys.len();
                info!(
                    key_index = self.current + 1,
                    usage = self.usage_count,
                    next_key_index = next + 1,
                    "api key at capacity; rotating"
                );
                self.current = next;
                self.usage_count = 1;
            }
        }
    }

    pub fn state(&self) -> PoolState {
        self.state
    }

    pub fn is_exhausted(&self) -> bool {
        self.state == PoolState::Exhausted
    }

    /// Zero-based index of the current key.
    pub fn current_index(&self) -> usize {
        self.current
    }

    /// Consecutive-use counter of the current key.
    pub fn usage_count(&self) -> u32 {
        self.usage_count
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl fmt::Debug for KeyPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPool")
            .field("keys", &self.keys.len())
            .field("current", &self.current)
            .field("usage_count", &self.usage_count)
            .field("quota_strikes", &self.quota_strikes)
            .field("state", &self.state)
            .finish()
    }
}
