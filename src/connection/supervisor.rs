//! Connect-timeout and reconnection policy
//!
//! Pure bookkeeping driven by the connection task's 500 ms tick. It never
//! touches the transport; it only tells the task what to do next.

use std::time::Duration;

use tokio::time::Instant;

use super::config::ConnectionConfig;
use super::ConnectionState;
use crate::events::TimeoutKind;

/// Automatic cache refreshes allowed per successful discovery cycle.
pub const MAX_AUTO_REFRESH: u32 = 5;

/// Snapshot of the connection the supervisor decides on.
#[derive(Debug, Clone, Copy)]
pub struct TickInput {
    pub state: ConnectionState,
    pub refreshing: bool,
    pub active_disconnect: bool,
    pub auto_reconnect: bool,
    /// A scan-assisted reconnect is already scheduled.
    pub scan_pending: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickAction {
    Idle,
    /// Link is down and auto-reconnect is on.
    Reconnect,
    /// The current attempt overran the connect timeout. `retry` says
    /// whether another attempt is allowed.
    Timeout { kind: TimeoutKind, retry: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectStrategy {
    /// Connect straight to the known address.
    Immediate,
    /// Scan for the peripheral first.
    ScanAssisted,
}

pub struct ReconnectSupervisor {
    conn_start: Instant,
    try_reconnect_times: u32,
    reconnect_immediately_count: u32,
    refresh_times: u32,
    connect_timeout: Duration,
    try_reconnect_limit: Option<u32>,
    reconnect_immediately_times: u32,
}

impl ReconnectSupervisor {
    pub fn new(config: &ConnectionConfig, now: Instant) -> Self {
        Self {
            conn_start: now,
            try_reconnect_times: 0,
            reconnect_immediately_count: 0,
            refresh_times: 0,
            connect_timeout: config.connect_timeout(),
            try_reconnect_limit: config.try_reconnect_times,
            reconnect_immediately_times: config.reconnect_immediately_times,
        }
    }

    /// Restart the connect-timeout clock.
    pub fn restart_timer(&mut self, now: Instant) {
        self.conn_start = now;
    }

    fn retries_remaining(&self) -> bool {
        match self.try_reconnect_limit {
            None => true,
            Some(limit) => self.try_reconnect_times < limit,
        }
    }

    pub fn on_tick(&mut self, now: Instant, input: TickInput) -> TickAction {
        if matches!(
            input.state,
            ConnectionState::ServiceDiscovered | ConnectionState::Released
        ) || input.refreshing
            || input.active_disconnect
        {
            return TickAction::Idle;
        }

        if input.state != ConnectionState::Disconnected {
            if now.saturating_duration_since(self.conn_start) > self.connect_timeout {
                self.conn_start = now;
                let kind = match input.state {
                    ConnectionState::Scanning => TimeoutKind::DeviceNotFound,
                    ConnectionState::Connecting => TimeoutKind::LinkNotEstablished,
                    _ => TimeoutKind::ServicesNotDiscovered,
                };
                let retry = input.auto_reconnect && self.retries_remaining();
                return TickAction::Timeout { kind, retry };
            }
        } else if input.auto_reconnect && !input.scan_pending && self.retries_remaining() {
            return TickAction::Reconnect;
        }
        TickAction::Idle
    }

    /// Count a reconnect attempt and pick how to make it.
    pub fn next_strategy(&mut self, now: Instant) -> ReconnectStrategy {
        self.try_reconnect_times += 1;
        self.conn_start = now;
        if self.reconnect_immediately_count < self.reconnect_immediately_times {
            self.reconnect_immediately_count += 1;
            ReconnectStrategy::Immediate
        } else {
            ReconnectStrategy::ScanAssisted
        }
    }

    /// Whether another automatic cache refresh may run. Counts the attempt
    /// either way.
    pub fn allow_auto_refresh(&mut self) -> bool {
        let allowed = self.refresh_times < MAX_AUTO_REFRESH;
        self.refresh_times += 1;
        allowed
    }

    /// Clear retry counters after a caller-requested reconnect.
    pub fn reset_retries(&mut self) {
        self.try_reconnect_times = 0;
        self.reconnect_immediately_count = 0;
    }

    /// All counters go back to zero once services are discovered.
    pub fn on_services_discovered(&mut self) {
        self.reset_retries();
        self.refresh_times = 0;
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.try_reconnect_times
    }
}
