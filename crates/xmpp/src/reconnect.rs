use std::time::Duration;

use skua_core::config::{ReconnectConfig, ReconnectKind};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::ErrorClass;

/// Capped exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub min: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max: max.max(min),
        }
    }

    /// `min(max, min * 2^(attempts-1))`; attempt 0 counts as the first.
    pub fn delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1);
        let factor = 2u32.checked_pow(exponent).unwrap_or(u32::MAX);
        self.min
            .checked_mul(factor)
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconnectAttemptState {
    pub attempt_count: u32,
    pub last_error_class: Option<ErrorClass>,
    pub next_attempt_at: Option<Instant>,
    /// Cleared by `stop()` and by a permanent failure.
    pub active: bool,
}

impl ReconnectAttemptState {
    fn start(&mut self) {
        *self = Self {
            active: true,
            ..Self::default()
        };
    }

    fn stop(&mut self) {
        *self = Self::default();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reachability {
    Unknown,
    Reachable,
    Unreachable,
}

/// Decides when the client tries to connect again.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconnectStrategy {
    None,
    Immediate(ReconnectAttemptState),
    Temporal {
        backoff: Backoff,
        state: ReconnectAttemptState,
    },
    /// Waits while `host` is unreachable, retries at once when it comes
    /// back and otherwise behaves like `Temporal`.
    NetworkReachability {
        host: String,
        reachability: Reachability,
        backoff: Backoff,
        state: ReconnectAttemptState,
    },
}

impl Default for ReconnectStrategy {
    fn default() -> Self {
        Self::temporal(Backoff::default())
    }
}

impl ReconnectStrategy {
    pub fn immediate() -> Self {
        Self::Immediate(ReconnectAttemptState::default())
    }

    pub fn temporal(backoff: Backoff) -> Self {
        Self::Temporal {
            backoff,
            state: ReconnectAttemptState::default(),
        }
    }

    pub fn network_reachability(host: impl Into<String>, backoff: Backoff) -> Self {
        Self::NetworkReachability {
            host: host.into(),
            reachability: Reachability::Unknown,
            backoff,
            state: ReconnectAttemptState::default(),
        }
    }

    pub fn from_config(config: &ReconnectConfig, host: &str) -> Self {
        let backoff = Backoff::new(
            Duration::from_secs(config.min_interval_secs),
            Duration::from_secs(config.max_interval_secs),
        );
        Self::from_kind(config.strategy, backoff, host)
    }

    pub fn from_kind(kind: ReconnectKind, backoff: Backoff, host: &str) -> Self {
        match kind {
            ReconnectKind::None => Self::None,
            ReconnectKind::Immediate => Self::immediate(),
            ReconnectKind::Temporal => Self::temporal(backoff),
            ReconnectKind::NetworkReachability => Self::network_reachability(host, backoff),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Immediate(_) => "immediate",
            Self::Temporal { .. } => "temporal",
            Self::NetworkReachability { .. } => "network_reachability",
        }
    }

    pub fn state(&self) -> Option<&ReconnectAttemptState> {
        match self {
            Self::None => None,
            Self::Immediate(state)
            | Self::Temporal { state, .. }
            | Self::NetworkReachability { state, .. } => Some(state),
        }
    }

    fn state_mut(&mut self) -> Option<&mut ReconnectAttemptState> {
        match self {
            Self::None => None,
            Self::Immediate(state)
            | Self::Temporal { state, .. }
            | Self::NetworkReachability { state, .. } => Some(state),
        }
    }

    pub fn is_active(&self) -> bool {
        self.state().is_some_and(|state| state.active)
    }

    /// Arm the strategy. Also the only way out of a permanent failure.
    pub fn start(&mut self) {
        if let Some(state) = self.state_mut() {
            state.start();
        }
    }

    pub fn stop(&mut self) {
        if let Some(state) = self.state_mut() {
            state.stop();
        }
    }

    /// Feed a connection failure; returns when to try again, if ever.
    pub fn on_failure(&mut self, class: ErrorClass, attempts: u32, now: Instant) -> Option<Instant> {
        let name = self.name();
        let next = match self {
            Self::None => return None,
            Self::Immediate(state) => {
                if !record_failure(state, class, attempts) {
                    return None;
                }
                Some(now)
            }
            Self::Temporal { backoff, state } => {
                if !record_failure(state, class, attempts) {
                    return None;
                }
                Some(now + backoff.delay(attempts))
            }
            Self::NetworkReachability {
                host,
                reachability,
                backoff,
                state,
            } => {
                if !record_failure(state, class, attempts) {
                    return None;
                }
                if class == ErrorClass::NetworkReachability {
                    *reachability = Reachability::Unreachable;
                }
                if *reachability == Reachability::Unreachable {
                    debug!(%host, "host unreachable, waiting for reachability");
                    None
                } else {
                    Some(now + backoff.delay(attempts))
                }
            }
        };

        if let Some(state) = self.state_mut() {
            state.next_attempt_at = next;
        }
        if let Some(at) = next {
            info!(
                strategy = name,
                attempts,
                delay_ms = at.saturating_duration_since(now).as_millis() as u64,
                "reconnect scheduled"
            );
        }
        next
    }

    /// A connection succeeded: the attempt counter starts over.
    pub fn on_connected(&mut self) {
        if let Self::NetworkReachability { reachability, .. } = self {
            *reachability = Reachability::Reachable;
        }
        if let Some(state) = self.state_mut() {
            state.attempt_count = 0;
            state.last_error_class = None;
            state.next_attempt_at = None;
        }
    }

    /// Reachability signal for the monitored host. Only the
    /// network-reachability strategy reacts; regaining reachability while
    /// a reconnect is pending schedules it immediately.
    pub fn reachability_changed(&mut self, reachable: bool, now: Instant) -> Option<Instant> {
        let Self::NetworkReachability {
            host,
            reachability,
            state,
            ..
        } = self
        else {
            return self.next_connection_attempt();
        };

        if reachable {
            let regained = *reachability != Reachability::Reachable;
            *reachability = Reachability::Reachable;
            if regained && state.active && state.attempt_count > 0 {
                debug!(%host, "host reachable again, reconnecting now");
                state.next_attempt_at = Some(now);
            }
        } else {
            *reachability = Reachability::Unreachable;
            state.next_attempt_at = None;
        }
        state.next_attempt_at
    }

    /// The scheduled attempt is being made.
    pub fn attempt_started(&mut self) {
        if let Some(state) = self.state_mut() {
            state.next_attempt_at = None;
        }
    }

    pub fn next_connection_attempt(&self) -> Option<Instant> {
        self.state()
            .filter(|state| state.active)
            .and_then(|state| state.next_attempt_at)
    }
}

/// Returns false when the strategy must not retry.
fn record_failure(state: &mut ReconnectAttemptState, class: ErrorClass, attempts: u32) -> bool {
    state.attempt_count = attempts;
    state.last_error_class = Some(class);
    state.next_attempt_at = None;
    if !state.active {
        return false;
    }
    if class == ErrorClass::Permanent {
        info!("permanent failure, automatic reconnection disabled until restarted");
        state.active = false;
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let backoff = Backoff::new(secs(1), secs(60));
        let delays: Vec<u64> = (1..=7).map(|n| backoff.delay(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60]);
        assert_eq!(backoff.delay(0), secs(1));
        assert_eq!(backoff.delay(200), secs(60));
    }

    #[test]
    fn temporal_schedules_relative_to_failure() {
        let now = Instant::now();
        let mut strategy = ReconnectStrategy::temporal(Backoff::new(secs(1), secs(60)));
        strategy.start();

        for (attempt, expected) in (1..=7).zip([1, 2, 4, 8, 16, 32, 60]) {
            let next = strategy
                .on_failure(ErrorClass::Temporal, attempt, now)
                .unwrap();
            assert_eq!(next - now, secs(expected));
            assert_eq!(strategy.next_connection_attempt(), Some(next));
        }

        strategy.on_connected();
        assert_eq!(strategy.state().unwrap().attempt_count, 0);
        assert_eq!(strategy.next_connection_attempt(), None);
    }

    #[test]
    fn permanent_failure_disables_until_started() {
        let now = Instant::now();
        let mut strategy = ReconnectStrategy::default();
        strategy.start();

        assert_eq!(strategy.on_failure(ErrorClass::Permanent, 1, now), None);
        assert!(!strategy.is_active());
        assert_eq!(strategy.on_failure(ErrorClass::Temporal, 2, now), None);

        strategy.start();
        assert_eq!(
            strategy.on_failure(ErrorClass::Temporal, 1, now),
            Some(now + secs(1))
        );
    }

    #[test]
    fn inactive_strategies_never_schedule() {
        let now = Instant::now();
        let mut none = ReconnectStrategy::None;
        none.start();
        assert_eq!(none.on_failure(ErrorClass::Temporal, 1, now), None);

        let mut stopped = ReconnectStrategy::immediate();
        assert_eq!(stopped.on_failure(ErrorClass::Temporal, 1, now), None);
    }

    #[test]
    fn immediate_retries_without_delay() {
        let now = Instant::now();
        let mut strategy = ReconnectStrategy::immediate();
        strategy.start();
        assert_eq!(strategy.on_failure(ErrorClass::Temporal, 5, now), Some(now));
        strategy.attempt_started();
        assert_eq!(strategy.next_connection_attempt(), None);
    }

    #[test]
    fn reachability_defers_then_fires_immediately() {
        let now = Instant::now();
        let mut strategy =
            ReconnectStrategy::network_reachability("capulet.example", Backoff::default());
        strategy.start();

        assert_eq!(
            strategy.on_failure(ErrorClass::NetworkReachability, 1, now),
            None
        );
        assert_eq!(strategy.on_failure(ErrorClass::Temporal, 2, now), None);

        let later = now + secs(90);
        assert_eq!(strategy.reachability_changed(true, later), Some(later));
        assert_eq!(strategy.next_connection_attempt(), Some(later));

        // Reachable again: plain backoff.
        strategy.attempt_started();
        assert_eq!(
            strategy.on_failure(ErrorClass::Temporal, 3, later),
            Some(later + secs(4))
        );

        assert_eq!(strategy.reachability_changed(false, later), None);
        assert_eq!(strategy.next_connection_attempt(), None);
    }

    #[test]
    fn reachability_while_connected_schedules_nothing() {
        let now = Instant::now();
        let mut strategy =
            ReconnectStrategy::network_reachability("capulet.example", Backoff::default());
        strategy.start();
        strategy.on_connected();
        assert_eq!(strategy.reachability_changed(false, now), None);
        assert_eq!(strategy.reachability_changed(true, now), None);
    }

    #[test]
    fn built_from_config() {
        let mut config = ReconnectConfig::default();
        config.strategy = ReconnectKind::NetworkReachability;
        config.min_interval_secs = 2;
        config.max_interval_secs = 30;

        let strategy = ReconnectStrategy::from_config(&config, "montague.example");
        assert_matches::assert_matches!(
            &strategy,
            ReconnectStrategy::NetworkReachability { host, backoff, .. }
                if host == "montague.example" && backoff.max == secs(30) && backoff.min == secs(2)
        );

        config.strategy = ReconnectKind::None;
        assert_eq!(
            ReconnectStrategy::from_config(&config, "montague.example"),
            ReconnectStrategy::None
        );
    }
}
