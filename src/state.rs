//! Everything the bridge owns, stored as the `wasmtime::Store` data.

use crate::closure::ClosureRegistry;
use crate::config::BridgeConfig;
use crate::dom::Document;
use crate::error::{BridgeError, BridgeResult};
use crate::error_bridge::PendingError;
use crate::event::HostEvent;
use crate::guest::GuestExports;
use crate::heap::{Handle, ObjectTable};
use crate::memory::MemoryView;
use crate::net::{self, HttpBackend, Network, StaticBackend};
use crate::perf::Performance;
use crate::random::RandomSource;
use crate::socket::{self, LoopbackBackend, SocketBackend, Sockets};
use crate::timers::{Clock, SystemClock, TimerQueue};
use crate::value::{Arena, EventId, HeadersId, HostValue, NodeId, ObjectId, Resource};
use hostbind_abi::Constant;
use std::collections::{BTreeMap, HashMap};

/// Transports and clock the bridge runs against.
pub struct Backends {
    pub http: Box<dyn HttpBackend>,
    pub sockets: Box<dyn SocketBackend>,
    pub clock: Box<dyn Clock>,
}

impl Default for Backends {
    fn default() -> Self {
        Self {
            http: Box::new(StaticBackend::default()),
            sockets: Box::new(LoopbackBackend::new()),
            clock: Box::new(SystemClock::default()),
        }
    }
}

impl Backends {
    /// Backends selected by the fetch and socket sections of a config.
    pub fn from_config(config: &BridgeConfig) -> Result<Self, reqwest::Error> {
        Ok(Self {
            http: net::backend_from_config(&config.fetch)?,
            sockets: socket::backend_from_config(&config.sockets),
            ..Self::default()
        })
    }

    pub fn with_http(mut self, http: impl HttpBackend + 'static) -> Self {
        self.http = Box::new(http);
        self
    }

    pub fn with_sockets(mut self, sockets: impl SocketBackend + 'static) -> Self {
        self.sockets = Box::new(sockets);
        self
    }

    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }
}

/// A line the guest logged through `log` or `console_error`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleLog {
    pub level: hostbind_abi::LogLevel,
    pub message: String,
}

pub struct BridgeState {
    pub config: BridgeConfig,
    pub table: ObjectTable<HostValue>,
    pub view: MemoryView,
    pub closures: ClosureRegistry,
    pub pending: PendingError,
    pub document: Document,
    pub events: Arena<EventId, HostEvent>,
    pub objects: Arena<ObjectId, BTreeMap<String, HostValue>>,
    pub network: Network,
    pub sockets: Sockets,
    pub timers: TimerQueue,
    pub random: RandomSource,
    pub perf: Performance,
    pub logs: Vec<ModuleLog>,
    pub(crate) exports: Option<GuestExports>,
    pub(crate) started: bool,
    poisoned: Option<BridgeError>,
    /// Outstanding references per arena record: guest handles, property
    /// bag entries and in-flight dispatch paths.
    refs: HashMap<Resource, u32>,
}

impl BridgeState {
    pub fn new(config: BridgeConfig, backends: Backends) -> Self {
        let table = ObjectTable::with_reserved(HostValue::reserved_constants(config.reserved_slots));
        let random = RandomSource::detect(config.random);
        Self {
            table,
            view: MemoryView::new(),
            closures: ClosureRegistry::new(),
            pending: PendingError::new(),
            document: Document::new(),
            events: Arena::new(),
            objects: Arena::new(),
            network: Network::new(backends.http),
            sockets: Sockets::new(backends.sockets),
            timers: TimerQueue::new(backends.clock),
            random,
            perf: Performance::new(),
            logs: Vec::new(),
            exports: None,
            started: false,
            poisoned: None,
            refs: HashMap::new(),
            config,
        }
    }

    /// Refuse all further calls. The first breach is kept.
    pub fn poison(&mut self, op: &str, err: &BridgeError) {
        tracing::error!(op, error = %err, "fatal bridge error; refusing further calls");
        if self.poisoned.is_none() {
            self.poisoned = Some(err.clone());
        }
    }

    pub fn poisoned(&self) -> Option<&BridgeError> {
        self.poisoned.as_ref()
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn value(&self, handle: Handle) -> BridgeResult<&HostValue> {
        self.table.get(handle)
    }

    /// Handle of one of the fixed constants.
    pub fn constant(&self, constant: Constant) -> Handle {
        // The config is validated to hold at least the constant slots.
        Handle::new(constant.slot(self.table.reserved() as u32).unwrap_or_default())
    }

    pub fn alloc(&mut self, value: HostValue) -> Handle {
        self.retain(&value);
        let handle = self.table.allocate(value);
        tracing::trace!(%handle, "allocated handle");
        handle
    }

    /// Allocate `Some` values; `None` maps to the zero handle.
    pub fn alloc_opt(&mut self, value: Option<HostValue>) -> Handle {
        value.map_or(Handle::NONE, |value| self.alloc(value))
    }

    /// Free `handle` and give up the reference it held.
    pub fn drop_handle(&mut self, handle: Handle) -> BridgeResult<HostValue> {
        let reserved = self.table.is_reserved(handle);
        let value = self.table.take(handle)?;
        if !reserved {
            self.release(&value);
        }
        Ok(value)
    }

    /// A second handle to the value behind `handle`.
    pub fn clone_handle(&mut self, handle: Handle) -> BridgeResult<Handle> {
        let value = self.table.get(handle)?.clone();
        Ok(self.alloc(value))
    }

    /// Count one more reference to the record behind `value`, if any.
    pub fn retain(&mut self, value: &HostValue) {
        if let Some(resource) = value.resource() {
            *self.refs.entry(resource).or_insert(0) += 1;
        }
    }

    /// Give up a reference taken with [`retain`](Self::retain). Records left
    /// without references are freed, along with whatever only they held.
    pub fn release(&mut self, value: &HostValue) {
        self.drain(value.resource().into_iter().collect());
    }

    pub fn references(&self, resource: Resource) -> u32 {
        self.refs.get(&resource).copied().unwrap_or(0)
    }

    /// Free the record behind `resource` now if nothing references it.
    pub fn collect(&mut self, resource: Resource) {
        if self.references(resource) == 0 {
            let mut work = Vec::new();
            self.reclaim(resource, &mut work);
            self.drain(work);
        }
    }

    /// Free children that a bulk DOM replacement left unreferenced.
    pub fn collect_orphans(&mut self) {
        for node in self.document.take_orphans() {
            self.collect(Resource::Node(node));
        }
    }

    fn drain(&mut self, mut work: Vec<Resource>) {
        while let Some(resource) = work.pop() {
            match self.refs.get_mut(&resource) {
                Some(count) if *count > 1 => {
                    *count -= 1;
                    continue;
                }
                Some(_) => {
                    self.refs.remove(&resource);
                }
                None => {
                    tracing::warn!(?resource, "released a record with no references");
                    continue;
                }
            }
            self.reclaim(resource, &mut work);
        }
    }

    /// Free an unreferenced record. References it held are pushed to `work`.
    fn reclaim(&mut self, resource: Resource, work: &mut Vec<Resource>) {
        match resource {
            Resource::Object(id) => {
                if let Some(bag) = self.objects.remove(id) {
                    work.extend(bag.values().filter_map(HostValue::resource));
                }
            }
            Resource::Node(id) => {
                let refs = &self.refs;
                self.document
                    .reclaim(id, |node| refs.contains_key(&Resource::Node(node)));
            }
            Resource::Headers(id) => self.network.reclaim_headers(id),
            Resource::Request(id) => {
                if let Some(headers) = self.network.reclaim_request(id) {
                    self.collect_headers(headers);
                }
            }
            Resource::Response(id) => {
                if let Some(headers) = self.network.reclaim_response(id) {
                    self.collect_headers(headers);
                }
            }
            Resource::Fetch(id) => {
                if let Some(request) = self.network.reclaim_fetch(id) {
                    if self.references(Resource::Request(request)) == 0 {
                        self.reclaim(Resource::Request(request), work);
                    }
                }
            }
            Resource::Socket(id) => self.sockets.reclaim(id),
        }
    }

    fn collect_headers(&mut self, id: HeadersId) {
        if self.references(Resource::Headers(id)) == 0 {
            self.network.reclaim_headers(id);
        }
    }

    /// Store `value` under `key`, releasing whatever it replaces.
    pub fn object_set(&mut self, id: ObjectId, key: &str, value: HostValue) -> BridgeResult<()> {
        if !self.objects.contains(id) {
            return Err(BridgeError::protocol(format!("unknown object {id}")));
        }
        self.retain(&value);
        let previous = self
            .objects
            .get_mut(id)
            .and_then(|bag| bag.insert(key.to_string(), value));
        if let Some(previous) = previous {
            self.release(&previous);
        }
        Ok(())
    }

    /// The document node behind `handle`.
    pub fn node(&self, handle: Handle) -> BridgeResult<NodeId> {
        match self.value(handle)? {
            HostValue::Document => Ok(self.document.root()),
            HostValue::Node(id) => Ok(*id),
            other => Err(BridgeError::protocol(format!(
                "expected node, found {}",
                other.kind()
            ))),
        }
    }

    /// Value for a node, with the root surfacing as the document.
    pub fn node_value(&self, id: NodeId) -> HostValue {
        if id == self.document.root() {
            HostValue::Document
        } else {
            HostValue::Node(id)
        }
    }

    /// The event currently being dispatched behind `handle`.
    pub fn event(&self, handle: Handle) -> BridgeResult<&HostEvent> {
        let id = self.value(handle)?.expect_event()?;
        self.events
            .get(id)
            .ok_or_else(|| BridgeError::protocol(format!("event {id} is no longer being dispatched")))
    }

    pub fn event_mut(&mut self, handle: Handle) -> BridgeResult<&mut HostEvent> {
        let id = self.value(handle)?.expect_event()?;
        self.events
            .get_mut(id)
            .ok_or_else(|| BridgeError::protocol(format!("event {id} is no longer being dispatched")))
    }
}
