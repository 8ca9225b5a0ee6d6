use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::task::{Context, Poll};

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::protocol::{AgentEvent, AgentEventType};

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("wait group already registered: {0}")]
    DuplicateWaitGroup(String),
}

pub type Result<T> = std::result::Result<T, BusError>;

pub type HandlerId = u64;
pub type SubscriptionId = String;

type Handler = Arc<dyn Fn(&AgentEvent) + Send + Sync>;
type CompletionCallback = Box<dyn FnOnce(WaitGroupCompletion) + Send>;

// ---------------------------------------------------------------------------
// Registrations
// ---------------------------------------------------------------------------

/// A listener owned by an agent. Matching events are buffered for the agent
/// until it calls [`EventBus::drain_pending_events`].
#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub agent_id: String,
    pub agent_name: String,
    /// Empty set matches every event type.
    pub event_types: HashSet<AgentEventType>,
    pub exclude_self: bool,
    pub one_shot: bool,
    /// Higher priority events are drained first.
    pub priority: i32,
}

impl Subscription {
    pub fn new(
        agent_id: impl Into<String>,
        agent_name: impl Into<String>,
        event_types: impl IntoIterator<Item = AgentEventType>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            agent_id: agent_id.into(),
            agent_name: agent_name.into(),
            event_types: event_types.into_iter().collect(),
            exclude_self: false,
            one_shot: false,
            priority: 0,
        }
    }

    /// Use a caller-chosen id; subscribing again with it replaces the
    /// earlier registration.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Skip events emitted by the subscribing agent itself.
    pub fn excluding_self(mut self) -> Self {
        self.exclude_self = true;
        self
    }

    /// Remove the subscription after its first delivery.
    pub fn once(mut self) -> Self {
        self.one_shot = true;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    fn matches(&self, event: &AgentEvent) -> bool {
        if self.exclude_self && event.agent_id == self.agent_id {
            return false;
        }
        self.event_types.is_empty() || self.event_types.contains(&event.event_type)
    }
}

/// Barrier over a known set of agents.
pub struct WaitGroupSpec {
    pub id: String,
    pub parent_agent_id: String,
    pub expected_agent_ids: HashSet<String>,
    pub event_types: HashSet<AgentEventType>,
    on_complete: CompletionCallback,
}

impl WaitGroupSpec {
    pub fn new<I, S, F>(
        id: impl Into<String>,
        parent_agent_id: impl Into<String>,
        expected_agent_ids: I,
        on_complete: F,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: FnOnce(WaitGroupCompletion) + Send + 'static,
    {
        Self {
            id: id.into(),
            parent_agent_id: parent_agent_id.into(),
            expected_agent_ids: expected_agent_ids.into_iter().map(Into::into).collect(),
            event_types: AgentEventType::completion_kinds().into_iter().collect(),
            on_complete: Box::new(on_complete),
        }
    }

    pub fn with_event_types(mut self, types: impl IntoIterator<Item = AgentEventType>) -> Self {
        self.event_types = types.into_iter().collect();
        self
    }
}

/// Handed to a wait group's callback when the last expected agent arrives.
#[derive(Debug, Clone)]
pub struct WaitGroupCompletion {
    pub group_id: String,
    pub parent_agent_id: String,
    /// The arrival event of each expected agent, in arrival order.
    pub events: Vec<AgentEvent>,
}

/// A single-match wait registered by `agent_id`. Events the agent emitted
/// itself never match.
#[derive(Debug, Clone)]
pub struct PreSubscribeSpec {
    pub id: String,
    pub agent_id: String,
    pub agent_name: String,
    /// Empty set matches every event type.
    pub event_types: HashSet<AgentEventType>,
    /// Only match events about this agent.
    pub from_agent_id: Option<String>,
}

impl PreSubscribeSpec {
    pub fn new(
        agent_id: impl Into<String>,
        agent_name: impl Into<String>,
        event_types: impl IntoIterator<Item = AgentEventType>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            agent_id: agent_id.into(),
            agent_name: agent_name.into(),
            event_types: event_types.into_iter().collect(),
            from_agent_id: None,
        }
    }

    pub fn from_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.from_agent_id = Some(agent_id.into());
        self
    }

    fn matches(&self, event: &AgentEvent) -> bool {
        if event.agent_id == self.agent_id {
            return false;
        }
        if let Some(from) = &self.from_agent_id {
            if &event.agent_id != from {
                return false;
            }
        }
        self.event_types.is_empty() || self.event_types.contains(&event.event_type)
    }
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

struct HandlerEntry {
    id: HandlerId,
    event_type: AgentEventType,
    handler: Handler,
}

struct SubscriptionEntry {
    sub: Subscription,
    /// Channel-backed subscriptions bypass the per-agent buffer.
    sink: Option<flume::Sender<AgentEvent>>,
}

struct PendingEvent {
    priority: i32,
    seq: u64,
    event: AgentEvent,
}

struct WaitGroupEntry {
    parent_agent_id: String,
    expected: HashSet<String>,
    arrived: HashSet<String>,
    event_types: HashSet<AgentEventType>,
    events: Vec<AgentEvent>,
    on_complete: CompletionCallback,
}

struct PreSubEntry {
    key: u64,
    spec: PreSubscribeSpec,
    tx: oneshot::Sender<AgentEvent>,
}

#[derive(Default)]
struct BusState {
    next_handler_id: HandlerId,
    next_seq: u64,
    next_pre_key: u64,
    handlers: Vec<HandlerEntry>,
    subscriptions: Vec<SubscriptionEntry>,
    pending: HashMap<String, Vec<PendingEvent>>,
    wait_groups: HashMap<String, WaitGroupEntry>,
    pre_subscriptions: Vec<PreSubEntry>,
    taps: Vec<flume::Sender<AgentEvent>>,
}

impl BusState {
    fn deliver_to_subscriptions(&mut self, event: &AgentEvent, seq: u64) {
        let mut order: Vec<usize> = (0..self.subscriptions.len())
            .filter(|&i| self.subscriptions[i].sub.matches(event))
            .collect();
        // Stable sort keeps registration order within one priority.
        order.sort_by_key(|&i| std::cmp::Reverse(self.subscriptions[i].sub.priority));

        let mut buffered_for: HashSet<&str> = HashSet::new();
        let mut retired: HashSet<usize> = HashSet::new();
        for i in order {
            let entry = &self.subscriptions[i];
            match &entry.sink {
                Some(tx) => {
                    if tx.send(event.clone()).is_err() {
                        retired.insert(i);
                        continue;
                    }
                }
                None => {
                    // One copy per agent, at the highest matching priority.
                    if buffered_for.insert(entry.sub.agent_id.as_str()) {
                        self.pending
                            .entry(entry.sub.agent_id.clone())
                            .or_default()
                            .push(PendingEvent {
                                priority: entry.sub.priority,
                                seq,
                                event: event.clone(),
                            });
                    }
                }
            }
            if entry.sub.one_shot {
                retired.insert(i);
            }
        }

        if !retired.is_empty() {
            let mut index = 0;
            self.subscriptions.retain(|_| {
                let keep = !retired.contains(&index);
                index += 1;
                keep
            });
        }
    }

    fn resolve_pre_subscriptions(&mut self, event: &AgentEvent) {
        // Owners that dropped their handle without disposing.
        self.pre_subscriptions.retain(|p| !p.tx.is_closed());

        let (matched, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pre_subscriptions)
            .into_iter()
            .partition(|p| p.spec.matches(event));
        self.pre_subscriptions = rest;
        for entry in matched {
            debug!(pre_subscription = %entry.spec.id, agent_id = %entry.spec.agent_id, "pre-subscription resolved");
            let _ = entry.tx.send(event.clone());
        }
    }

    fn record_arrival(&mut self, event: &AgentEvent) -> Vec<(CompletionCallback, WaitGroupCompletion)> {
        let mut finished = Vec::new();
        for (id, group) in self.wait_groups.iter_mut() {
            if !group.event_types.contains(&event.event_type)
                || !group.expected.contains(&event.agent_id)
            {
                continue;
            }
            if !group.arrived.insert(event.agent_id.clone()) {
                continue;
            }
            group.events.push(event.clone());
            if group.expected.is_subset(&group.arrived) {
                finished.push(id.clone());
            }
        }

        finished
            .into_iter()
            .filter_map(|id| {
                let group = self.wait_groups.remove(&id)?;
                let completion = WaitGroupCompletion {
                    group_id: id,
                    parent_agent_id: group.parent_agent_id,
                    events: group.events,
                };
                Some((group.on_complete, completion))
            })
            .collect()
    }
}

fn lock_state(inner: &Mutex<BusState>) -> MutexGuard<'_, BusState> {
    inner.lock().unwrap_or_else(|poisoned| {
        warn!("event bus lock poisoned; recovering");
        poisoned.into_inner()
    })
}

fn run_completion(callback: CompletionCallback, completion: WaitGroupCompletion) {
    let group_id = completion.group_id.clone();
    debug!(wait_group = %group_id, arrivals = completion.events.len(), "wait group complete");
    if catch_unwind(AssertUnwindSafe(move || callback(completion))).is_err() {
        warn!(wait_group = %group_id, "wait group callback panicked");
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Coordination bus shared by every agent in the process.
///
/// All bookkeeping for one emitted event (one-shot retirement, wait-group
/// arrival, pre-subscription resolution, buffering) happens under a single
/// lock, so listeners observing the same event never race each other.
/// Handlers and wait-group callbacks run after the lock is released but
/// before [`emit`](EventBus::emit) returns, which lets them call back into
/// the bus. The bus is cheap to clone.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<BusState>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for one event type. Handlers run synchronously in
    /// registration order.
    pub fn on<F>(&self, event_type: AgentEventType, handler: F) -> HandlerId
    where
        F: Fn(&AgentEvent) + Send + Sync + 'static,
    {
        let mut state = lock_state(&self.inner);
        state.next_handler_id += 1;
        let id = state.next_handler_id;
        state.handlers.push(HandlerEntry {
            id,
            event_type,
            handler: Arc::new(handler),
        });
        id
    }

    /// Remove a handler. Returns `false` if it was not registered.
    pub fn off(&self, id: HandlerId) -> bool {
        let mut state = lock_state(&self.inner);
        let before = state.handlers.len();
        state.handlers.retain(|h| h.id != id);
        state.handlers.len() != before
    }

    /// Register a buffered subscription. Re-using an id replaces the earlier
    /// registration.
    pub fn subscribe(&self, subscription: Subscription) -> SubscriptionId {
        self.insert_subscription(subscription, None)
    }

    /// Like [`subscribe`](Self::subscribe), but deliveries go to the returned
    /// receiver instead of the agent's buffer.
    pub fn subscribe_channel(
        &self,
        subscription: Subscription,
    ) -> (SubscriptionId, flume::Receiver<AgentEvent>) {
        let (tx, rx) = flume::unbounded();
        let id = self.insert_subscription(subscription, Some(tx));
        (id, rx)
    }

    fn insert_subscription(
        &self,
        subscription: Subscription,
        sink: Option<flume::Sender<AgentEvent>>,
    ) -> SubscriptionId {
        let id = subscription.id.clone();
        let mut state = lock_state(&self.inner);
        state.subscriptions.retain(|s| s.sub.id != id);
        debug!(
            subscription = %id,
            agent_id = %subscription.agent_id,
            one_shot = subscription.one_shot,
            "subscription registered"
        );
        state.subscriptions.push(SubscriptionEntry {
            sub: subscription,
            sink,
        });
        id
    }

    /// Remove a subscription. Events it already buffered stay pending for
    /// the agent until drained. Returns `false` for unknown ids.
    pub fn unsubscribe(&self, id: &str) -> bool {
        let mut state = lock_state(&self.inner);
        let before = state.subscriptions.len();
        state.subscriptions.retain(|s| s.sub.id != id);
        state.subscriptions.len() != before
    }

    /// Receive every event emitted from now on, unfiltered.
    pub fn tap(&self) -> flume::Receiver<AgentEvent> {
        let (tx, rx) = flume::unbounded();
        lock_state(&self.inner).taps.push(tx);
        rx
    }

    /// Publish an event to every matching listener.
    pub fn emit(&self, event: AgentEvent) {
        let (handlers, completions) = {
            let mut state = lock_state(&self.inner);
            let seq = state.next_seq;
            state.next_seq += 1;

            let handlers: Vec<Handler> = state
                .handlers
                .iter()
                .filter(|h| h.event_type == event.event_type)
                .map(|h| Arc::clone(&h.handler))
                .collect();
            state.deliver_to_subscriptions(&event, seq);
            state.resolve_pre_subscriptions(&event);
            let completions = state.record_arrival(&event);
            state.taps.retain(|tx| tx.send(event.clone()).is_ok());
            (handlers, completions)
        };

        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
                warn!(
                    event_type = %event.event_type,
                    agent_id = %event.agent_id,
                    "event handler panicked"
                );
            }
        }
        for (callback, completion) in completions {
            run_completion(callback, completion);
        }
    }

    /// Return and clear the events buffered for `agent_id`, highest
    /// subscription priority first, then in emission order.
    pub fn drain_pending_events(&self, agent_id: &str) -> Vec<AgentEvent> {
        let mut pending = lock_state(&self.inner)
            .pending
            .remove(agent_id)
            .unwrap_or_default();
        pending.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));
        pending.into_iter().map(|p| p.event).collect()
    }

    /// Number of events buffered for `agent_id`, without draining them.
    pub fn pending_count(&self, agent_id: &str) -> usize {
        lock_state(&self.inner)
            .pending
            .get(agent_id)
            .map_or(0, Vec::len)
    }

    /// Register a barrier. A group with no expected agents completes
    /// immediately.
    pub fn create_wait_group(&self, spec: WaitGroupSpec) -> Result<()> {
        let immediate = {
            let mut state = lock_state(&self.inner);
            if state.wait_groups.contains_key(&spec.id) {
                return Err(BusError::DuplicateWaitGroup(spec.id));
            }
            if spec.expected_agent_ids.is_empty() {
                Some((
                    spec.on_complete,
                    WaitGroupCompletion {
                        group_id: spec.id,
                        parent_agent_id: spec.parent_agent_id,
                        events: Vec::new(),
                    },
                ))
            } else {
                debug!(
                    wait_group = %spec.id,
                    expected = spec.expected_agent_ids.len(),
                    "wait group registered"
                );
                state.wait_groups.insert(
                    spec.id,
                    WaitGroupEntry {
                        parent_agent_id: spec.parent_agent_id,
                        expected: spec.expected_agent_ids,
                        arrived: HashSet::new(),
                        event_types: spec.event_types,
                        events: Vec::new(),
                        on_complete: spec.on_complete,
                    },
                );
                None
            }
        };

        if let Some((callback, completion)) = immediate {
            run_completion(callback, completion);
        }
        Ok(())
    }

    /// Retire a group without firing it.
    pub fn cancel_wait_group(&self, id: &str) -> bool {
        lock_state(&self.inner).wait_groups.remove(id).is_some()
    }

    /// Agents of a group that have not reported yet.
    pub fn wait_group_outstanding(&self, id: &str) -> Option<Vec<String>> {
        let state = lock_state(&self.inner);
        let group = state.wait_groups.get(id)?;
        let mut outstanding: Vec<String> =
            group.expected.difference(&group.arrived).cloned().collect();
        outstanding.sort();
        Some(outstanding)
    }

    /// Register a wait that resolves with the first matching event.
    pub fn pre_subscribe(&self, spec: PreSubscribeSpec) -> PreSubscription {
        let (tx, rx) = oneshot::channel();
        let key = {
            let mut state = lock_state(&self.inner);
            state.next_pre_key += 1;
            let key = state.next_pre_key;
            state.pre_subscriptions.push(PreSubEntry { key, spec, tx });
            key
        };
        PreSubscription {
            rx,
            disposer: Disposer {
                key,
                bus: Arc::downgrade(&self.inner),
                disposed: Arc::new(AtomicBool::new(false)),
            },
        }
    }

    /// Drop every registration owned by `agent_id`: subscriptions, buffered
    /// events, pre-subscriptions and wait groups it is the parent of.
    pub fn remove_agent(&self, agent_id: &str) {
        let mut state = lock_state(&self.inner);
        state.subscriptions.retain(|s| s.sub.agent_id != agent_id);
        state.pending.remove(agent_id);
        state.pre_subscriptions.retain(|p| p.spec.agent_id != agent_id);
        state.wait_groups.retain(|_, g| g.parent_agent_id != agent_id);
        debug!(agent_id, "agent registrations removed");
    }

    /// Registered handlers across all event types.
    pub fn handler_count(&self) -> usize {
        lock_state(&self.inner).handlers.len()
    }

    /// Live subscriptions, buffered and channel-backed.
    pub fn subscription_count(&self) -> usize {
        lock_state(&self.inner).subscriptions.len()
    }

    /// Wait groups that have neither completed nor been cancelled.
    pub fn wait_group_count(&self) -> usize {
        lock_state(&self.inner).wait_groups.len()
    }

    /// Pre-subscriptions still waiting for a match.
    pub fn pre_subscription_count(&self) -> usize {
        lock_state(&self.inner).pre_subscriptions.len()
    }
}

// ---------------------------------------------------------------------------
// PreSubscription
// ---------------------------------------------------------------------------

/// Removes a pre-subscription from the bus. Cloneable so another task can
/// dispose while the owner is awaiting.
#[derive(Clone)]
pub struct Disposer {
    key: u64,
    bus: Weak<Mutex<BusState>>,
    disposed: Arc<AtomicBool>,
}

impl Disposer {
    /// Idempotent, and harmless after the subscription has resolved.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(inner) = self.bus.upgrade() {
            lock_state(&inner)
                .pre_subscriptions
                .retain(|p| p.key != self.key);
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

/// Future resolving to the first event matching a [`PreSubscribeSpec`].
///
/// If the registration is disposed (or removed with its agent) before a
/// match, the future never completes; callers bound it with a timeout.
/// Dropping the handle disposes it.
pub struct PreSubscription {
    rx: oneshot::Receiver<AgentEvent>,
    disposer: Disposer,
}

impl PreSubscription {
    /// Withdraw the registration; the future will never resolve.
    pub fn dispose(&self) {
        self.disposer.dispose();
    }

    /// Handle for disposing from another task while this one is awaited.
    pub fn disposer(&self) -> Disposer {
        self.disposer.clone()
    }

    /// Non-blocking check for an already-delivered event.
    pub fn try_take(&mut self) -> Option<AgentEvent> {
        self.rx.try_recv().ok()
    }
}

impl Future for PreSubscription {
    type Output = AgentEvent;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<AgentEvent> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(event)) => Poll::Ready(event),
            // Sender gone without a value: disposed or owner removed.
            Poll::Ready(Err(_)) | Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for PreSubscription {
    fn drop(&mut self) {
        self.disposer.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(agent: &str) -> AgentEvent {
        AgentEvent::new(AgentEventType::ReportSubmitted, agent, agent)
    }

    #[test]
    fn subscription_filters() {
        let sub = Subscription::new("a", "alpha", [AgentEventType::MessageSent]).excluding_self();
        assert!(!sub.matches(&AgentEvent::new(AgentEventType::MessageSent, "a", "alpha")));
        assert!(sub.matches(&AgentEvent::new(AgentEventType::MessageSent, "b", "beta")));
        assert!(!sub.matches(&report("b")));

        let any = Subscription::new("a", "alpha", []);
        assert!(any.matches(&report("a")));
    }

    #[test]
    fn pre_subscribe_spec_never_matches_own_events() {
        let spec = PreSubscribeSpec::new("p", "parent", [AgentEventType::ReportSubmitted]);
        assert!(!spec.matches(&report("p")));
        assert!(spec.matches(&report("c")));

        let scoped = spec.from_agent("c2");
        assert!(!scoped.matches(&report("c1")));
        assert!(scoped.matches(&report("c2")));
    }

    #[test]
    fn duplicate_wait_group_rejected() {
        let bus = EventBus::new();
        bus.create_wait_group(WaitGroupSpec::new("g", "p", ["c1"], |_| {}))
            .unwrap();
        let err = bus
            .create_wait_group(WaitGroupSpec::new("g", "p", ["c2"], |_| {}))
            .unwrap_err();
        assert!(matches!(err, BusError::DuplicateWaitGroup(id) if id == "g"));
    }

    #[test]
    fn dropped_pre_subscription_is_pruned() {
        let bus = EventBus::new();
        let pre = bus.pre_subscribe(PreSubscribeSpec::new("p", "parent", []));
        assert_eq!(bus.pre_subscription_count(), 1);
        drop(pre);
        assert_eq!(bus.pre_subscription_count(), 0);
    }
}
