//! Cooperative delivery of host events to guest closures.
//!
//! Nothing runs concurrently with the guest. Timers, socket events and fetch
//! completions queue up on the host and are delivered one task per turn when
//! the embedder runs the loop.

use crate::closure;
use crate::error::BridgeResult;
use crate::event::{EventDetail, HostEvent};
use crate::guest::{BridgeContext, Guest};
use crate::net::Completion;
use crate::socket::SocketEvent;
use crate::state::BridgeState;
use crate::value::{ClosureId, EventId, HostValue, NodeId, Resource, SocketId, TimerId};
use hostbind_abi::Constant;
use std::time::Duration;

/// One unit of work for the guest.
#[derive(Debug, Clone, PartialEq)]
pub enum Task {
    Timer { timer: TimerId, closure: ClosureId },
    Socket { socket: SocketId, event: SocketEvent },
    Fetch(Completion),
}

/// Pick the next task: due timers first, then socket events, then fetches.
///
/// With `wait` set, sleeps until the next timer when nothing else is ready.
/// While connections are open it wakes every socket poll interval instead,
/// so the loop stays alive as long as a socket can still deliver.
pub fn next_task(state: &mut BridgeState, wait: bool) -> BridgeResult<Option<Task>> {
    loop {
        if let Some((timer, closure)) = state.timers.pop_due() {
            return Ok(Some(Task::Timer { timer, closure }));
        }
        if let Some((socket, event)) = state.sockets.next_event() {
            return Ok(Some(Task::Socket { socket, event }));
        }
        if let Some(completion) = state.network.next_completion()? {
            return Ok(Some(Task::Fetch(completion)));
        }
        if !wait {
            return Ok(None);
        }
        if state.sockets.is_awaiting() {
            let interval = Duration::from_millis(state.config.sockets.poll_interval_ms.max(1));
            state.timers.wait_at_most(interval);
            continue;
        }
        if !state.timers.wait_for_next() {
            return Ok(None);
        }
    }
}

fn live<C: BridgeContext>(guest: &Guest<C>, closure: ClosureId, what: &str) -> bool {
    let live = guest.state().closures.is_live(closure);
    if !live {
        tracing::warn!(%closure, what, "skipping callback on a released closure");
    }
    live
}

/// Deliver `task` to its closure.
pub fn run_task<C: BridgeContext>(guest: &mut Guest<C>, task: Task) -> BridgeResult<()> {
    match task {
        Task::Timer { timer, closure } => {
            if !live(guest, closure, "timer") {
                return Ok(());
            }
            tracing::debug!(%timer, "timer fired");
            let arg = guest.state().constant(Constant::Undefined);
            closure::invoke(guest, closure, arg)
        }
        Task::Fetch(completion) => {
            // A settled fetch nobody holds a handle to is finished with.
            guest.state_mut().collect(Resource::Fetch(completion.fetch));
            if !live(guest, completion.on_settle, "fetch") {
                if let Ok(response) = completion.outcome {
                    guest.state_mut().collect(Resource::Response(response));
                }
                return Ok(());
            }
            let value = match completion.outcome {
                Ok(response) => HostValue::Response(response),
                Err(err) => HostValue::Error(err),
            };
            let arg = guest.state_mut().alloc(value);
            closure::invoke(guest, completion.on_settle, arg)
        }
        Task::Socket { socket, event } => {
            let closed = matches!(event, SocketEvent::Close { .. });
            let outcome = deliver_socket_event(guest, socket, event);
            if closed {
                guest.state_mut().collect(Resource::Socket(socket));
            }
            outcome
        }
    }
}

fn deliver_socket_event<C: BridgeContext>(
    guest: &mut Guest<C>,
    socket: SocketId,
    event: SocketEvent,
) -> BridgeResult<()> {
    let Some(handler) = guest.state().sockets.handler(socket, event.kind())? else {
        tracing::trace!(%socket, event = event.event_type(), "no handler registered");
        return Ok(());
    };
    if !live(guest, handler, "socket") {
        return Ok(());
    }
    let event_type = event.event_type();
    let detail = match event {
        SocketEvent::Open => EventDetail::None,
        SocketEvent::Message(payload) => EventDetail::Message(payload),
        SocketEvent::Close {
            code,
            reason,
            was_clean,
        } => EventDetail::Close {
            code,
            reason,
            was_clean,
        },
        SocketEvent::Error(message) => EventDetail::Error(message),
    };
    let record = HostEvent::new(event_type, Some(HostValue::Socket(socket))).with_detail(detail);
    let state = guest.state_mut();
    let id = state.events.insert(record);
    let arg = state.alloc(HostValue::Event(id));
    let outcome = closure::invoke(guest, handler, arg);
    guest.state_mut().events.remove(id);
    outcome
}

/// Dispatch a DOM event at `target` and bubble it to the root, returning
/// false if a listener called `prevent_default`.
///
/// The path is fixed when dispatch starts. On each node, listeners are those
/// registered when the node is reached, minus any removed by an earlier
/// listener. Each one receives its own event handle.
pub fn dispatch_dom_event<C: BridgeContext>(
    guest: &mut Guest<C>,
    target: NodeId,
    event_type: &str,
) -> BridgeResult<bool> {
    let path = guest.state().document.ancestors(target)?;
    let state = guest.state_mut();
    let values: Vec<HostValue> = path.iter().map(|node| state.node_value(*node)).collect();
    // Nodes on the path outlive the dispatch even if a listener drops them.
    for value in &values {
        state.retain(value);
    }
    let record = HostEvent::new(event_type, Some(state.node_value(target))).with_path(values.clone());
    let id = state.events.insert(record);
    tracing::debug!(%target, event_type, depth = path.len(), "dispatching event");

    let outcome = propagate(guest, id, &path, event_type);

    let state = guest.state_mut();
    let event = state.events.remove(id);
    for value in &values {
        state.release(value);
    }
    outcome?;
    Ok(!event.is_some_and(|event| event.default_prevented))
}

fn propagate<C: BridgeContext>(
    guest: &mut Guest<C>,
    id: EventId,
    path: &[NodeId],
    event_type: &str,
) -> BridgeResult<()> {
    for node in path {
        let listeners = guest.state().document.listeners(*node, event_type)?;
        let current = guest.state().node_value(*node);
        if let Some(event) = guest.state_mut().events.get_mut(id) {
            event.current_target = Some(current);
        }
        for listener in listeners {
            let still_registered = guest
                .state()
                .document
                .listeners(*node, event_type)?
                .contains(&listener);
            if !still_registered || !live(guest, listener, "listener") {
                continue;
            }
            let arg = guest.state_mut().alloc(HostValue::Event(id));
            closure::invoke(guest, listener, arg)?;
            if stopped(guest, id, |event| event.immediate_propagation_stopped) {
                return Ok(());
            }
        }
        if stopped(guest, id, |event| event.propagation_stopped) {
            tracing::trace!(node = %node, event_type, "propagation stopped");
            return Ok(());
        }
    }
    Ok(())
}

fn stopped<C: BridgeContext>(guest: &Guest<C>, id: EventId, test: impl Fn(&HostEvent) -> bool) -> bool {
    guest.state().events.get(id).is_some_and(test)
}

/// Runs queued tasks until none remain.
#[derive(Debug, Clone, Copy)]
pub struct EventLoop {
    max_turns: usize,
    wait_for_timers: bool,
}

impl Default for EventLoop {
    fn default() -> Self {
        Self {
            max_turns: usize::MAX,
            wait_for_timers: true,
        }
    }
}

impl EventLoop {
    pub fn new(max_turns: usize) -> Self {
        Self {
            max_turns,
            ..Self::default()
        }
    }

    /// Stop at the first turn with nothing ready instead of sleeping until
    /// the next timer.
    pub fn without_waiting(mut self) -> Self {
        self.wait_for_timers = false;
        self
    }

    /// Run until idle or `max_turns` tasks have run. Returns the number of
    /// tasks delivered.
    pub fn run_until_idle<C: BridgeContext>(&self, guest: &mut Guest<C>) -> BridgeResult<usize> {
        let mut turns = 0;
        while turns < self.max_turns {
            let Some(task) = next_task(guest.state_mut(), self.wait_for_timers)? else {
                break;
            };
            run_task(guest, task)?;
            turns += 1;
        }
        if turns == self.max_turns {
            tracing::debug!(turns, "event loop stopped at its turn limit");
        }
        Ok(turns)
    }
}
