use std::time::Duration;

use deck_protocol::CLOSE_NORMAL;

/// How long to wait between attempts, and when to give up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPolicy {
    /// Constant delay; abandoned once `max_attempts` consecutive reconnects
    /// have failed.
    Fixed { delay: Duration, max_attempts: u32 },
    /// Doubling delay capped at `max_delay`; never gives up.
    Exponential { base: Duration, max_delay: Duration },
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::Fixed {
            delay: Duration::from_secs(2),
            max_attempts: 3,
        }
    }
}

impl ReconnectPolicy {
    pub fn max_attempts(&self) -> Option<u32> {
        match self {
            Self::Fixed { max_attempts, .. } => Some((*max_attempts).max(1)),
            Self::Exponential { .. } => None,
        }
    }

    /// Delay before the `attempt`-th reconnect (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self {
            Self::Fixed { delay, .. } => *delay,
            Self::Exponential { base, max_delay } => {
                let capped = attempt.clamp(1, 31);
                let mult = 1u64 << (capped - 1);
                let millis = base.as_millis() as u64;
                let raw = millis.saturating_mul(mult);
                Duration::from_millis(raw.min(max_delay.as_millis() as u64))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPhase {
    Idle,
    Connecting,
    Open,
    /// Waiting out the delay before the next attempt.
    Retrying,
    /// Normal closure or cancelled by the owner.
    Stopped,
    /// Gave up; only manual action brings the channel back.
    Exhausted,
}

/// What the owner should do after a channel closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseDecision {
    Retry { attempt: u32, delay: Duration },
    Stop,
    Exhausted { attempts: u32 },
}

/// Per-channel retry bookkeeping.
#[derive(Debug, Clone)]
pub struct ReconnectState {
    policy: ReconnectPolicy,
    attempts: u32,
    phase: ReconnectPhase,
}

impl ReconnectState {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
            phase: ReconnectPhase::Idle,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn phase(&self) -> ReconnectPhase {
        self.phase
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// A fresh channel is being opened.
    pub fn on_connecting(&mut self) {
        if matches!(
            self.phase,
            ReconnectPhase::Idle | ReconnectPhase::Retrying
        ) {
            self.phase = ReconnectPhase::Connecting;
        }
    }

    pub fn on_opened(&mut self) {
        if self.is_finished() {
            return;
        }
        self.attempts = 0;
        self.phase = ReconnectPhase::Open;
    }

    /// Record a close and decide whether another attempt follows.
    ///
    /// A clean close with the normal-closure code is final. Once stopped or
    /// exhausted the answer never changes, so late closes cannot schedule
    /// further attempts.
    pub fn on_closed(&mut self, code: Option<u16>, clean: bool) -> CloseDecision {
        match self.phase {
            ReconnectPhase::Stopped => return CloseDecision::Stop,
            ReconnectPhase::Exhausted => {
                return CloseDecision::Exhausted {
                    attempts: self.attempts,
                };
            }
            _ => {}
        }

        if clean && code == Some(CLOSE_NORMAL) {
            self.phase = ReconnectPhase::Stopped;
            return CloseDecision::Stop;
        }

        // `max_attempts` counts reconnects, so the close that follows the
        // last permitted reconnect is the one that exhausts.
        if let Some(max) = self.policy.max_attempts()
            && self.attempts >= max
        {
            self.phase = ReconnectPhase::Exhausted;
            return CloseDecision::Exhausted {
                attempts: self.attempts,
            };
        }

        self.attempts = self.attempts.saturating_add(1);
        self.phase = ReconnectPhase::Retrying;
        CloseDecision::Retry {
            attempt: self.attempts,
            delay: self.policy.delay_for(self.attempts),
        }
    }

    /// The owner no longer wants this channel.
    pub fn cancel(&mut self) {
        if self.phase != ReconnectPhase::Exhausted {
            self.phase = ReconnectPhase::Stopped;
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self.phase,
            ReconnectPhase::Stopped | ReconnectPhase::Exhausted
        )
    }
}
