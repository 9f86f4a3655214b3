//! Per-address module runtime.
//!
//! A [`ModuleRuntime`] owns the device logic, its state tree, its delayed-call
//! scheduler and its request routes. The gateway only sees the object-safe
//! [`Module`] face. Everything for one module runs on the gateway loop, so the
//! state is never locked.

use core::fmt;
use core::str::FromStr;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use crate::field::CodecError;
use crate::patch::{Observer, ObserverId, PatchError, PatchOp, StateTree};
use crate::protocol::OutboundFrame;
use crate::registry::MessageRegistry;
use crate::scheduler::{DelayedCall, Scheduler, SchedulerError, SchedulerStats, Timer};
use crate::schema::Message;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ModuleError {
    /// Fatal: the module can no longer fire delayed calls.
    #[error("scheduler failure: {0}")]
    Scheduler(#[from] SchedulerError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    State(#[from] PatchError),
    #[error("no schema named `{0}`")]
    UnknownSchema(String),
    #[error("outbound channel closed")]
    OutboundClosed,
}

impl ModuleError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ModuleError::Scheduler(_))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verb {
    #[default]
    Get,
    Put,
    Post,
    Delete,
}

impl FromStr for Verb {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Verb::Get),
            "PUT" => Ok(Verb::Put),
            "POST" => Ok(Verb::Post),
            "DELETE" => Ok(Verb::Delete),
            other => Err(format!("unsupported verb `{other}`")),
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Verb::Get => "GET",
            Verb::Put => "PUT",
            Verb::Post => "POST",
            Verb::Delete => "DELETE",
        };
        write!(f, "{name}")
    }
}

/// A request routed to a module: what is left of the path after the route
/// segment, plus the body.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub path_info: String,
    pub body: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReplyBody {
    Text(String),
    Json(Value),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub status: u16,
    pub body: ReplyBody,
}

impl Reply {
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            body: ReplyBody::Text(body.into()),
        }
    }

    pub fn json(body: Value) -> Self {
        Self {
            status: 200,
            body: ReplyBody::Json(body),
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn not_found() -> Self {
        Self::text("Not found\r\n").with_status(404)
    }

    pub fn method_not_found() -> Self {
        Self::text("Method not found\r\n").with_status(404)
    }

    pub fn bad_request(reason: impl fmt::Display) -> Self {
        Self::text(format!("{reason}\r\n")).with_status(400)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Everything device logic may touch besides itself.
pub struct ModuleContext<C> {
    address: u8,
    kind: &'static str,
    state: StateTree,
    scheduler: Scheduler<C>,
    registry: Arc<MessageRegistry>,
    outbound: mpsc::UnboundedSender<OutboundFrame>,
    fault: Option<SchedulerError>,
}

impl<C: fmt::Debug> fmt::Debug for ModuleContext<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleContext")
            .field("address", &self.address)
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("scheduler", &self.scheduler)
            .finish()
    }
}

impl<C> ModuleContext<C> {
    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn state(&self) -> &StateTree {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut StateTree {
        &mut self.state
    }

    pub fn registry(&self) -> &MessageRegistry {
        &self.registry
    }

    /// Default-valued message for the named schema, ready to be filled in.
    pub fn message(&self, schema: &str) -> Result<Message, ModuleError> {
        self.registry
            .schema(schema)
            .map(|schema| schema.default_message())
            .ok_or_else(|| ModuleError::UnknownSchema(schema.to_string()))
    }

    /// Encode `message` for this module and hand it to the bus sender.
    pub fn send(&self, message: &Message) -> Result<(), ModuleError> {
        let frame = self.registry.encode(self.address, message)?;
        debug!(address = self.address, %frame, message = message.name(), "queueing outbound frame");
        self.outbound
            .send(frame)
            .map_err(|_| ModuleError::OutboundClosed)
    }

    pub fn schedule(&mut self, call: DelayedCall<C>) -> Result<(), ModuleError> {
        let result = self.scheduler.schedule(call, Utc::now());
        self.record(result)
    }

    /// Supersede every pending delayed call with `calls`.
    pub fn replace_schedule(
        &mut self,
        calls: impl IntoIterator<Item = DelayedCall<C>>,
    ) -> Result<(), ModuleError> {
        let result = self.scheduler.replace(calls, Utc::now());
        self.record(result)
    }

    pub fn clear_schedule(&mut self) {
        self.scheduler.clear();
    }

    pub fn pending(&self) -> impl Iterator<Item = (DateTime<Utc>, &C)> {
        self.scheduler.pending()
    }

    pub fn scheduler_stats(&self) -> &SchedulerStats {
        self.scheduler.stats()
    }

    // Rearm failures stick even if the logic swallows the error.
    fn record(&mut self, result: Result<(), SchedulerError>) -> Result<(), ModuleError> {
        if let Err(e) = &result {
            self.fault.get_or_insert_with(|| e.clone());
        }
        Ok(result?)
    }
}

/// Device behaviour plugged into a [`ModuleRuntime`].
pub trait ModuleLogic: Send + Sized + 'static {
    /// Context carried by this device's delayed calls.
    type Call: fmt::Debug + Send + 'static;

    fn kind(&self) -> &'static str;

    /// Register device routes. `""` and `type` are always present.
    fn routes(_routes: &mut RouteTable<Self>) {}

    fn on_message(
        &mut self,
        ctx: &mut ModuleContext<Self::Call>,
        message: &Message,
    ) -> Result<(), ModuleError>;

    /// A delayed call came due. Returned work is spawned detached and never
    /// awaited by the firing loop.
    fn on_delayed_call(
        &mut self,
        _ctx: &mut ModuleContext<Self::Call>,
        call: Self::Call,
    ) -> Result<Option<BoxFuture<'static, ()>>, ModuleError> {
        warn!(?call, "delayed call without handler");
        Ok(None)
    }
}

pub type Handler<L> = fn(&mut L, &mut ModuleContext<<L as ModuleLogic>::Call>, &Request) -> Result<Reply, ModuleError>;

/// `(path segment, verb) → handler` table.
pub struct RouteTable<L: ModuleLogic> {
    routes: BTreeMap<(String, Verb), Handler<L>>,
}

impl<L: ModuleLogic> fmt::Debug for RouteTable<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.routes.keys()).finish()
    }
}

impl<L: ModuleLogic> Default for RouteTable<L> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L: ModuleLogic> RouteTable<L> {
    pub fn new() -> Self {
        let mut table = Self {
            routes: BTreeMap::new(),
        };
        table.add("type", Verb::Get, describe_type::<L>);
        table
    }

    pub fn add(&mut self, segment: &str, verb: Verb, handler: Handler<L>) -> &mut Self {
        self.routes.insert((segment.to_string(), verb), handler);
        self
    }

    pub fn get(&self, segment: &str, verb: Verb) -> Option<Handler<L>> {
        self.routes.get(&(segment.to_string(), verb)).copied()
    }

    /// Route segments, sorted and deduplicated across verbs.
    pub fn segments(&self) -> BTreeSet<&str> {
        self.routes.keys().map(|(segment, _)| segment.as_str()).collect()
    }
}

fn describe_type<L: ModuleLogic>(
    logic: &mut L,
    ctx: &mut ModuleContext<L::Call>,
    request: &Request,
) -> Result<Reply, ModuleError> {
    if !request.path_info.is_empty() {
        return Ok(Reply::not_found());
    }
    Ok(Reply::text(format!("{} at 0x{:02x}\r\n", logic.kind(), ctx.address())))
}

/// Object-safe face of a runtime, as used by the gateway.
pub trait Module: Send {
    fn address(&self) -> u8;

    fn kind(&self) -> &'static str;

    fn handle_message(&mut self, message: &Message) -> Result<(), ModuleError>;

    /// Wake-up from the timer armed under `generation`; returns how many
    /// delayed calls fired.
    fn on_timer_fire(&mut self, generation: u64) -> Result<usize, ModuleError>;

    fn dispatch(&mut self, path_info: &str, verb: Verb, body: Value) -> Result<Reply, ModuleError>;

    fn subscribe(&mut self, observer: Observer) -> ObserverId;

    fn unsubscribe(&mut self, id: ObserverId) -> bool;

    fn full_sync(&self) -> Vec<PatchOp>;

    fn state(&self) -> &Value;
}

pub struct ModuleRuntime<L: ModuleLogic> {
    logic: L,
    ctx: ModuleContext<L::Call>,
    routes: RouteTable<L>,
    tasks: JoinSet<()>,
}

impl<L: ModuleLogic + fmt::Debug> fmt::Debug for ModuleRuntime<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleRuntime")
            .field("logic", &self.logic)
            .field("ctx", &self.ctx)
            .field("routes", &self.routes)
            .field("tasks", &self.tasks.len())
            .finish()
    }
}

impl<L: ModuleLogic> ModuleRuntime<L> {
    pub fn new(
        logic: L,
        address: u8,
        registry: Arc<MessageRegistry>,
        timer: Box<dyn Timer>,
        outbound: mpsc::UnboundedSender<OutboundFrame>,
    ) -> Self {
        let mut routes = RouteTable::new();
        L::routes(&mut routes);
        let kind = logic.kind();
        Self {
            logic,
            ctx: ModuleContext {
                address,
                kind,
                state: StateTree::new(),
                scheduler: Scheduler::new(timer),
                registry,
                outbound,
                fault: None,
            },
            routes,
            tasks: JoinSet::new(),
        }
    }

    pub fn logic(&self) -> &L {
        &self.logic
    }

    pub fn context(&self) -> &ModuleContext<L::Call> {
        &self.ctx
    }

    /// Direct access for seeding a plan or state from outside the logic.
    pub fn context_mut(&mut self) -> &mut ModuleContext<L::Call> {
        &mut self.ctx
    }

    pub fn routes(&self) -> &RouteTable<L> {
        &self.routes
    }

    /// Detached delayed-call work still running.
    pub fn running_tasks(&self) -> usize {
        self.tasks.len()
    }

    /// Once a rearm failed, every later call reports it.
    fn check_fault(&self) -> Result<(), ModuleError> {
        match &self.ctx.fault {
            Some(e) => Err(ModuleError::Scheduler(e.clone())),
            None => Ok(()),
        }
    }

    fn finish<T>(&self, result: Result<T, ModuleError>) -> Result<T, ModuleError> {
        self.check_fault()?;
        result
    }

    /// Fire every delayed call due at `now`, in fire order.
    pub fn fire_due(&mut self, now: DateTime<Utc>) -> Result<usize, ModuleError> {
        let (due, rearm) = self.ctx.scheduler.take_due(now);
        self.run_calls(due, rearm)
    }

    fn run_calls(
        &mut self,
        due: Vec<L::Call>,
        rearm: Result<(), SchedulerError>,
    ) -> Result<usize, ModuleError> {
        let fired = due.len();
        for call in due {
            match self.logic.on_delayed_call(&mut self.ctx, call) {
                Ok(Some(work)) => self.spawn_detached(work),
                Ok(None) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!(address = self.ctx.address, error = %e, "delayed call failed"),
            }
        }
        if let Err(e) = rearm {
            self.ctx.fault.get_or_insert(e);
        }
        self.finish(Ok(fired))
    }

    fn spawn_detached(&mut self, work: BoxFuture<'static, ()>) {
        while let Some(done) = self.tasks.try_join_next() {
            if let Err(e) = done {
                error!(address = self.ctx.address, error = %e, "delayed call task failed");
            }
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                self.tasks.spawn_on(work, &runtime);
            }
            Err(e) => error!(address = self.ctx.address, error = %e, "no runtime for delayed call work"),
        }
    }
}

impl<L: ModuleLogic> Module for ModuleRuntime<L> {
    fn address(&self) -> u8 {
        self.ctx.address
    }

    fn kind(&self) -> &'static str {
        self.ctx.kind
    }

    fn handle_message(&mut self, message: &Message) -> Result<(), ModuleError> {
        self.check_fault()?;
        let result = self.logic.on_message(&mut self.ctx, message);
        self.finish(result)
    }

    fn on_timer_fire(&mut self, generation: u64) -> Result<usize, ModuleError> {
        self.check_fault()?;
        let (due, rearm) = self.ctx.scheduler.on_timer_fire(generation, Utc::now());
        self.run_calls(due, rearm)
    }

    /// Split off the first path segment and route on `(segment, verb)`.
    fn dispatch(&mut self, path_info: &str, verb: Verb, body: Value) -> Result<Reply, ModuleError> {
        self.check_fault()?;
        let trimmed = path_info.strip_prefix('/').unwrap_or(path_info);
        let (segment, rest) = trimmed.split_once('/').unwrap_or((trimmed, ""));

        if segment.is_empty() {
            if verb != Verb::Get {
                return Ok(Reply::method_not_found());
            }
            if !rest.is_empty() {
                return Ok(Reply::not_found());
            }
            let mut index = String::new();
            for segment in self.routes.segments() {
                index.push_str(segment);
                index.push_str("\r\n");
            }
            return Ok(Reply::text(index));
        }

        let Some(handler) = self.routes.get(segment, verb) else {
            return Ok(Reply::method_not_found());
        };
        let request = Request {
            path_info: rest.to_string(),
            body,
        };
        let result = handler(&mut self.logic, &mut self.ctx, &request);
        self.finish(result)
    }

    fn subscribe(&mut self, observer: Observer) -> ObserverId {
        self.ctx.state.subscribe(observer)
    }

    fn unsubscribe(&mut self, id: ObserverId) -> bool {
        self.ctx.state.unsubscribe(id)
    }

    fn full_sync(&self) -> Vec<PatchOp> {
        self.ctx.state.full_sync()
    }

    fn state(&self) -> &Value {
        self.ctx.state.value()
    }
}
