//! Event records handed to listener closures.

use crate::socket::Payload;
use crate::value::HostValue;

#[derive(Debug, Clone, PartialEq)]
pub enum EventDetail {
    None,
    Message(Payload),
    Close {
        code: u16,
        reason: String,
        was_clean: bool,
    },
    Error(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct HostEvent {
    pub event_type: String,
    pub target: Option<HostValue>,
    /// The node whose listeners are running.
    pub current_target: Option<HostValue>,
    /// Target first, then each ancestor the event bubbles through.
    pub path: Vec<HostValue>,
    pub cancelable: bool,
    pub default_prevented: bool,
    pub propagation_stopped: bool,
    pub immediate_propagation_stopped: bool,
    pub detail: EventDetail,
}

impl HostEvent {
    pub fn new(event_type: impl Into<String>, target: Option<HostValue>) -> Self {
        Self {
            event_type: event_type.into(),
            current_target: target.clone(),
            path: target.iter().cloned().collect(),
            target,
            cancelable: true,
            default_prevented: false,
            propagation_stopped: false,
            immediate_propagation_stopped: false,
            detail: EventDetail::None,
        }
    }

    pub fn with_path(mut self, path: Vec<HostValue>) -> Self {
        self.path = path;
        self
    }

    pub fn with_detail(mut self, detail: EventDetail) -> Self {
        self.cancelable = false;
        self.detail = detail;
        self
    }

    /// Only cancelable events record the request.
    pub fn prevent_default(&mut self) {
        if self.cancelable {
            self.default_prevented = true;
        }
    }

    /// Listeners on the current node still run; ancestors are skipped.
    pub fn stop_propagation(&mut self) {
        self.propagation_stopped = true;
    }

    pub fn stop_immediate_propagation(&mut self) {
        self.propagation_stopped = true;
        self.immediate_propagation_stopped = true;
    }
}
