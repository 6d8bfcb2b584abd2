//! Register refresh as an explicit timer-armed state machine.
//!
//! The driver (see [`RegisterHandle::refresh`](super::RegisterHandle::refresh)) starts the
//! operation, performs the actions it returns, and feeds back report arrivals and timer
//! expiries. With the default policy gets go out at 0, 20 and 70 ms and the operation
//! times out at 150 ms.

use crate::bus::RefreshPolicy;

/// Tolerance for timer wake-ups that land a hair before the deadline.
const EPSILON_MS: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RefreshState {
    Idle,
    /// First get sent; resend at `deadline`.
    Waiting { deadline: f64 },
    /// `attempt`-th resend sent; next action at `deadline`.
    Retrying { attempt: u32, deadline: f64 },
    Done,
    TimedOut,
}

/// What the driver must do next.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RefreshAction {
    /// Send a get-register command; `attempt` counts from 1.
    SendGet { attempt: u32 },
    /// Sleep until this bus timestamp unless a report arrives first.
    WaitUntil(f64),
    Done,
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct RefreshOp {
    retry_delays: Vec<f64>,
    timeout: f64,
    started: f64,
    gets_sent: u32,
    state: RefreshState,
}

impl RefreshOp {
    pub fn new(policy: &RefreshPolicy) -> Self {
        Self {
            retry_delays: policy.retry_delays_ms.iter().map(|&d| d as f64).collect(),
            timeout: policy.timeout_ms as f64,
            started: 0.0,
            gets_sent: 0,
            state: RefreshState::Idle,
        }
    }

    pub fn state(&self) -> RefreshState {
        self.state
    }

    pub fn gets_sent(&self) -> u32 {
        self.gets_sent
    }

    pub fn started(&self) -> f64 {
        self.started
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, RefreshState::Done | RefreshState::TimedOut)
    }

    pub fn start(&mut self, now: f64) -> RefreshAction {
        self.started = now;
        self.gets_sent = 1;
        self.state = RefreshState::Waiting { deadline: self.next_deadline(now) };
        RefreshAction::SendGet { attempt: 1 }
    }

    /// A report for the register arrived.
    pub fn report_received(&mut self) {
        if !self.is_finished() && self.state != RefreshState::Idle {
            self.state = RefreshState::Done;
        }
    }

    /// Advance on a timer wake-up.
    pub fn poll(&mut self, now: f64) -> RefreshAction {
        let deadline = match self.state {
            RefreshState::Idle => return self.start(now),
            RefreshState::Done => return RefreshAction::Done,
            RefreshState::TimedOut => return RefreshAction::TimedOut,
            RefreshState::Waiting { deadline } | RefreshState::Retrying { deadline, .. } => {
                deadline
            }
        };

        if now + EPSILON_MS >= self.started + self.timeout {
            self.state = RefreshState::TimedOut;
            return RefreshAction::TimedOut;
        }
        if now + EPSILON_MS >= deadline && (self.gets_sent as usize) <= self.retry_delays.len() {
            self.gets_sent += 1;
            self.state = RefreshState::Retrying {
                attempt: self.gets_sent - 1,
                deadline: self.next_deadline(now),
            };
            return RefreshAction::SendGet { attempt: self.gets_sent };
        }
        RefreshAction::WaitUntil(deadline)
    }

    fn next_deadline(&self, now: f64) -> f64 {
        let overall = self.started + self.timeout;
        match self.retry_delays.get(self.gets_sent as usize - 1) {
            Some(delay) => (now + delay).min(overall),
            None => overall,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RefreshPolicy {
        RefreshPolicy { retry_delays_ms: vec![20, 50], timeout_ms: 150 }
    }

    /// Drive the op as the async driver would, with no report ever arriving.
    fn run_silent(op: &mut RefreshOp) -> Vec<f64> {
        let mut sends = Vec::new();
        let mut now = 0.0;
        let mut action = op.start(now);
        loop {
            match action {
                RefreshAction::SendGet { .. } => {
                    sends.push(now);
                    action = op.poll(now);
                }
                RefreshAction::WaitUntil(t) => {
                    now = t;
                    action = op.poll(now);
                }
                RefreshAction::Done | RefreshAction::TimedOut => return sends,
            }
        }
    }

    #[test]
    fn silent_register_gets_three_requests_then_times_out() {
        let mut op = RefreshOp::new(&policy());
        let sends = run_silent(&mut op);
        assert_eq!(sends, vec![0.0, 20.0, 70.0]);
        assert_eq!(op.state(), RefreshState::TimedOut);
        assert_eq!(op.gets_sent(), 3);
    }

    #[test]
    fn report_completes_the_operation() {
        let mut op = RefreshOp::new(&policy());
        assert_eq!(op.start(0.0), RefreshAction::SendGet { attempt: 1 });
        assert_eq!(op.poll(5.0), RefreshAction::WaitUntil(20.0));
        assert_eq!(op.poll(20.0), RefreshAction::SendGet { attempt: 2 });
        assert!(matches!(op.state(), RefreshState::Retrying { attempt: 1, .. }));

        op.report_received();
        assert_eq!(op.state(), RefreshState::Done);
        assert_eq!(op.poll(200.0), RefreshAction::Done);
    }

    #[test]
    fn report_before_start_is_ignored() {
        let mut op = RefreshOp::new(&policy());
        op.report_received();
        assert_eq!(op.state(), RefreshState::Idle);
    }

    #[test]
    fn custom_policy_is_honoured() {
        let mut op = RefreshOp::new(&RefreshPolicy { retry_delays_ms: vec![10], timeout_ms: 40 });
        assert_eq!(run_silent(&mut op), vec![0.0, 10.0]);
    }

    #[test]
    fn retries_never_exceed_the_overall_timeout() {
        let mut op = RefreshOp::new(&RefreshPolicy { retry_delays_ms: vec![100, 100], timeout_ms: 120 });
        assert_eq!(run_silent(&mut op), vec![0.0, 100.0]);
    }
}
