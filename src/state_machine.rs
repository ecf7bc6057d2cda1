//! Entity state machines
//!
//! Order, engine and WebSocket lifecycles as explicit transition tables.
//! An illegal transition is a caller error and fails fast with the
//! offending pair in the message; it is never silently accepted.

use std::fmt;
use thiserror::Error;

/// Rejected transition.
#[derive(Debug, Error)]
#[error("{machine}: cannot transition {from} -> {to}")]
pub struct StateMachineError {
    pub machine: &'static str,
    pub from: String,
    pub to: String,
}

/// Order lifecycle.
///
/// NEW -> SUBMITTED -> (ACKNOWLEDGED | FAILED);
/// ACKNOWLEDGED -> (PARTIALLY_FILLED | FILLED | CANCELLED | REJECTED | EXPIRED);
/// PARTIALLY_FILLED -> (FILLED | CANCELLED); FAILED -> (ACKNOWLEDGED | REJECTED).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OrderState {
    New,
    Submitted,
    Acknowledged,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
    Expired,
    Failed,
}

impl OrderState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderState::New => "NEW",
            OrderState::Submitted => "SUBMITTED",
            OrderState::Acknowledged => "ACKNOWLEDGED",
            OrderState::PartiallyFilled => "PARTIALLY_FILLED",
            OrderState::Filled => "FILLED",
            OrderState::Cancelled => "CANCELLED",
            OrderState::Rejected => "REJECTED",
            OrderState::Expired => "EXPIRED",
            OrderState::Failed => "FAILED",
        }
    }

    fn allowed(&self) -> &'static [OrderState] {
        match self {
            OrderState::New => &[OrderState::Submitted],
            OrderState::Submitted => &[OrderState::Acknowledged, OrderState::Failed],
            OrderState::Acknowledged => &[
                OrderState::PartiallyFilled,
                OrderState::Filled,
                OrderState::Cancelled,
                OrderState::Rejected,
                OrderState::Expired,
            ],
            OrderState::PartiallyFilled => &[OrderState::Filled, OrderState::Cancelled],
            OrderState::Failed => &[OrderState::Acknowledged, OrderState::Rejected],
            _ => &[],
        }
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderState::Filled
                | OrderState::Cancelled
                | OrderState::Rejected
                | OrderState::Expired
        )
    }

    /// Open on the exchange (counts toward the open-order projection).
    #[inline]
    pub fn is_active(&self) -> bool {
        matches!(self, OrderState::Acknowledged | OrderState::PartiallyFilled)
    }

    /// Map an exchange order status onto the machine. The exchange's `NEW`
    /// means the order is live, which is `ACKNOWLEDGED` on our side.
    pub fn from_exchange_status(status: &str) -> OrderState {
        match status {
            "PARTIALLY_FILLED" => OrderState::PartiallyFilled,
            "FILLED" => OrderState::Filled,
            "CANCELED" => OrderState::Cancelled,
            "REJECTED" => OrderState::Rejected,
            "EXPIRED" => OrderState::Expired,
            _ => OrderState::Acknowledged,
        }
    }
}

impl fmt::Display for OrderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Engine lifecycle. SAFE permits only position-reducing actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineState {
    Booting,
    Running,
    Paused,
    Safe,
}

impl EngineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineState::Booting => "BOOTING",
            EngineState::Running => "RUNNING",
            EngineState::Paused => "PAUSED",
            EngineState::Safe => "SAFE",
        }
    }

    fn allowed(&self) -> &'static [EngineState] {
        match self {
            EngineState::Booting => &[EngineState::Running],
            EngineState::Running => &[EngineState::Paused, EngineState::Safe],
            EngineState::Paused => &[EngineState::Running],
            EngineState::Safe => &[EngineState::Running],
        }
    }

    #[inline]
    pub fn can_trade(&self) -> bool {
        matches!(self, EngineState::Running)
    }

    #[inline]
    pub fn can_reduce_only(&self) -> bool {
        matches!(self, EngineState::Safe)
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// WebSocket connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WebSocketState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl WebSocketState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebSocketState::Disconnected => "DISCONNECTED",
            WebSocketState::Connecting => "CONNECTING",
            WebSocketState::Connected => "CONNECTED",
            WebSocketState::Reconnecting => "RECONNECTING",
        }
    }

    fn allowed(&self) -> &'static [WebSocketState] {
        match self {
            WebSocketState::Disconnected => &[WebSocketState::Connecting],
            WebSocketState::Connecting => {
                &[WebSocketState::Connected, WebSocketState::Disconnected]
            }
            WebSocketState::Connected => {
                &[WebSocketState::Reconnecting, WebSocketState::Disconnected]
            }
            WebSocketState::Reconnecting => {
                &[WebSocketState::Connected, WebSocketState::Disconnected]
            }
        }
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        matches!(self, WebSocketState::Connected)
    }
}

impl fmt::Display for WebSocketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Transition-table driver shared by the three machines.
///
/// Keeps the current state and the transition history; `force_state`
/// bypasses the table for recovery paths and logs at warn.
#[derive(Debug)]
pub struct StateMachine<S> {
    name: &'static str,
    state: S,
    history: Vec<(S, S)>,
}

pub trait TransitionTable: Copy + PartialEq + fmt::Display {
    fn transitions(&self) -> &'static [Self];
}

impl TransitionTable for OrderState {
    fn transitions(&self) -> &'static [Self] {
        self.allowed()
    }
}

impl TransitionTable for EngineState {
    fn transitions(&self) -> &'static [Self] {
        self.allowed()
    }
}

impl TransitionTable for WebSocketState {
    fn transitions(&self) -> &'static [Self] {
        self.allowed()
    }
}

impl<S: TransitionTable + 'static> StateMachine<S> {
    pub fn new(name: &'static str, initial: S) -> Self {
        Self {
            name,
            state: initial,
            history: Vec::new(),
        }
    }

    #[inline]
    pub fn state(&self) -> S {
        self.state
    }

    pub fn can_transition(&self, to: S) -> bool {
        self.state.transitions().contains(&to)
    }

    pub fn transition(&mut self, to: S) -> Result<S, StateMachineError> {
        if !self.can_transition(to) {
            return Err(StateMachineError {
                machine: self.name,
                from: self.state.to_string(),
                to: to.to_string(),
            });
        }
        let from = self.state;
        self.state = to;
        self.history.push((from, to));
        tracing::debug!(machine = self.name, %from, %to, "state transition");
        Ok(to)
    }

    /// Recovery escape hatch: set the state without consulting the table.
    pub fn force_state(&mut self, to: S) {
        let from = self.state;
        self.state = to;
        self.history.push((from, to));
        tracing::warn!(machine = self.name, %from, %to, "forced state transition");
    }

    pub fn history(&self) -> &[(S, S)] {
        &self.history
    }
}

pub fn order_machine() -> StateMachine<OrderState> {
    StateMachine::new("order", OrderState::New)
}

pub fn engine_machine() -> StateMachine<EngineState> {
    StateMachine::new("engine", EngineState::Booting)
}

pub fn websocket_machine() -> StateMachine<WebSocketState> {
    StateMachine::new("websocket", WebSocketState::Disconnected)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_happy_path() {
        let mut machine = order_machine();
        machine.transition(OrderState::Submitted).unwrap();
        machine.transition(OrderState::Acknowledged).unwrap();
        machine.transition(OrderState::PartiallyFilled).unwrap();
        machine.transition(OrderState::Filled).unwrap();

        assert!(machine.state().is_terminal());
        assert_eq!(machine.history().len(), 4);
    }

    #[test]
    fn test_order_illegal_transition_rejected() {
        let mut machine = order_machine();
        let err = machine.transition(OrderState::Filled).unwrap_err();
        assert_eq!(err.from, "NEW");
        assert_eq!(err.to, "FILLED");
        // state unchanged after rejection
        assert_eq!(machine.state(), OrderState::New);
    }

    #[test]
    fn test_order_failed_recovery() {
        let mut machine = order_machine();
        machine.transition(OrderState::Submitted).unwrap();
        machine.transition(OrderState::Failed).unwrap();
        // a late ack after a submit failure is legal
        machine.transition(OrderState::Acknowledged).unwrap();
        assert!(machine.state().is_active());
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        for state in [
            OrderState::Filled,
            OrderState::Cancelled,
            OrderState::Rejected,
            OrderState::Expired,
        ] {
            assert!(state.transitions().is_empty());
        }
    }

    #[test]
    fn test_engine_safe_mode() {
        let mut machine = engine_machine();
        machine.transition(EngineState::Running).unwrap();
        machine.transition(EngineState::Safe).unwrap();

        assert!(!machine.state().can_trade());
        assert!(machine.state().can_reduce_only());

        // SAFE cannot pause; only return to RUNNING
        assert!(machine.transition(EngineState::Paused).is_err());
        machine.transition(EngineState::Running).unwrap();
        assert!(machine.state().can_trade());
    }

    #[test]
    fn test_websocket_reconnect_cycle() {
        let mut machine = websocket_machine();
        machine.transition(WebSocketState::Connecting).unwrap();
        machine.transition(WebSocketState::Connected).unwrap();
        machine.transition(WebSocketState::Reconnecting).unwrap();
        machine.transition(WebSocketState::Connected).unwrap();
        assert!(machine.state().is_connected());

        // cannot jump straight from DISCONNECTED to CONNECTED
        let mut fresh = websocket_machine();
        assert!(fresh.transition(WebSocketState::Connected).is_err());
    }

    #[test]
    fn test_from_exchange_status() {
        assert_eq!(
            OrderState::from_exchange_status("NEW"),
            OrderState::Acknowledged
        );
        assert_eq!(
            OrderState::from_exchange_status("CANCELED"),
            OrderState::Cancelled
        );
        assert_eq!(
            OrderState::from_exchange_status("FILLED"),
            OrderState::Filled
        );
    }

    #[test]
    fn test_force_state_records_history() {
        let mut machine = order_machine();
        machine.force_state(OrderState::Acknowledged);
        assert_eq!(machine.state(), OrderState::Acknowledged);
        assert_eq!(machine.history().len(), 1);
    }
}
