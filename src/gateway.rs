//! The gateway event loop.
//!
//! One task owns every module runtime. Inbound frames, timer wake-ups and
//! requests are multiplexed with `tokio::select!`, so a runtime never runs
//! concurrently with itself. State changes leave through a broadcast channel,
//! outbound frames through an unbounded channel to the bus sender.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::devices;
use crate::module::{Module, ModuleError, Reply, Verb};
use crate::patch::{ObserverError, PatchOp};
use crate::protocol::{Frame, OutboundFrame};
use crate::registry::{DecodeError, MessageRegistry};
use crate::scheduler::{Timer, TimerFired, TokioTimer};
use crate::schema::Message;

/// What a factory gets to build a runtime for a newly seen address.
pub struct ModuleParts {
    pub registry: Arc<MessageRegistry>,
    pub timer: Box<dyn Timer>,
    pub outbound: mpsc::UnboundedSender<OutboundFrame>,
}

/// Builds the runtime for an address from the first message seen from it.
/// `None` leaves the address unmanaged.
pub type ModuleFactory = Box<dyn Fn(u8, &Message, ModuleParts) -> Option<Box<dyn Module>> + Send>;

/// Patch operations from one module, in mutation order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatePatch {
    pub address: u8,
    pub ops: Vec<PatchOp>,
}

/// Current state of every module plus a receiver for all later patches.
#[derive(Debug)]
pub struct Subscription {
    pub snapshot: Vec<StatePatch>,
    pub patches: broadcast::Receiver<StatePatch>,
}

#[derive(Debug)]
pub enum GatewayRequest {
    Dispatch {
        address: u8,
        path: String,
        verb: Verb,
        body: Value,
        reply: oneshot::Sender<Reply>,
    },
    /// Snapshot and subscribe in one step, so no patch falls in between.
    Subscribe {
        reply: oneshot::Sender<Subscription>,
    },
    Stats {
        reply: oneshot::Sender<GatewayStats>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayStats {
    pub frames_received: u64,
    pub frames_decoded: u64,
    pub unknown_frames: u64,
    pub decode_errors: u64,
    pub modules_created: u64,
    pub modules_faulted: u64,
    pub module_errors: u64,
    pub timer_wakeups: u64,
    pub delayed_calls_fired: u64,
    pub requests: u64,
}

pub struct Gateway {
    registry: Arc<MessageRegistry>,
    modules: BTreeMap<u8, Box<dyn Module>>,
    factory: ModuleFactory,
    outbound: mpsc::UnboundedSender<OutboundFrame>,
    patches: broadcast::Sender<StatePatch>,
    wake_tx: mpsc::UnboundedSender<TimerFired>,
    wake_rx: mpsc::UnboundedReceiver<TimerFired>,
    stats: GatewayStats,
}

impl Gateway {
    pub fn new(
        registry: Arc<MessageRegistry>,
        outbound: mpsc::UnboundedSender<OutboundFrame>,
        patch_capacity: usize,
    ) -> Self {
        let (patches, _) = broadcast::channel(patch_capacity.max(1));
        let (wake_tx, wake_rx) = mpsc::unbounded_channel();
        Self {
            registry,
            modules: BTreeMap::new(),
            factory: Box::new(devices::create_module),
            outbound,
            patches,
            wake_tx,
            wake_rx,
            stats: GatewayStats::default(),
        }
    }

    pub fn with_factory(
        mut self,
        factory: impl Fn(u8, &Message, ModuleParts) -> Option<Box<dyn Module>> + Send + 'static,
    ) -> Self {
        self.factory = Box::new(factory);
        self
    }

    pub fn subscribe_patches(&self) -> broadcast::Receiver<StatePatch> {
        self.patches.subscribe()
    }

    pub fn stats(&self) -> &GatewayStats {
        &self.stats
    }

    pub fn module(&self, address: u8) -> Option<&dyn Module> {
        self.modules.get(&address).map(|module| module.as_ref())
    }

    pub fn addresses(&self) -> impl Iterator<Item = u8> + '_ {
        self.modules.keys().copied()
    }

    /// Every module's state as adds from empty.
    pub fn full_sync(&self) -> Vec<StatePatch> {
        self.modules
            .iter()
            .map(|(address, module)| StatePatch {
                address: *address,
                ops: module.full_sync(),
            })
            .filter(|patch| !patch.ops.is_empty())
            .collect()
    }

    pub async fn run(
        mut self,
        mut frames: mpsc::Receiver<Frame>,
        mut requests: mpsc::Receiver<GatewayRequest>,
        shutdown: impl Future<Output = ()>,
    ) -> GatewayStats {
        tokio::pin!(shutdown);
        info!(schemas = self.registry.len(), "gateway running");

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("gateway shutting down");
                    break;
                }
                frame = frames.recv() => match frame {
                    Some(frame) => self.handle_frame(&frame),
                    None => {
                        info!("frame source closed");
                        break;
                    }
                },
                Some(fired) = self.wake_rx.recv() => self.handle_wakeup(fired),
                Some(request) = requests.recv() => self.handle_request(request),
            }
        }

        info!(stats = ?self.stats, "gateway stopped");
        self.stats
    }

    pub fn handle_frame(&mut self, frame: &Frame) {
        self.stats.frames_received += 1;
        let message = match self.registry.decode(frame) {
            Ok(message) => message,
            Err(e @ DecodeError::UnknownFrame { .. }) => {
                self.stats.unknown_frames += 1;
                debug!(error = %e, "dropping frame");
                return;
            }
            Err(e) => {
                self.stats.decode_errors += 1;
                warn!(error = %e, "dropping undecodable frame");
                return;
            }
        };
        self.stats.frames_decoded += 1;
        debug!(%frame, message = message.name(), "decoded frame");

        let address = frame.address;
        if !self.modules.contains_key(&address) && !self.create_module(address, &message) {
            return;
        }
        if let Some(module) = self.modules.get_mut(&address) {
            let result = module.handle_message(&message);
            self.settle(address, result);
        }
    }

    fn create_module(&mut self, address: u8, first: &Message) -> bool {
        let parts = ModuleParts {
            registry: Arc::clone(&self.registry),
            timer: Box::new(TokioTimer::new(address, self.wake_tx.clone())),
            outbound: self.outbound.clone(),
        };
        let Some(mut module) = (self.factory)(address, first, parts) else {
            debug!(address, message = first.name(), "no module for address");
            return false;
        };

        let patches = self.patches.clone();
        module.subscribe(Box::new(move |ops: &[PatchOp]| -> Result<(), ObserverError> {
            // Nobody listening is fine
            let _ = patches.send(StatePatch {
                address,
                ops: ops.to_vec(),
            });
            Ok(())
        }));

        info!(address, kind = module.kind(), "module discovered");
        self.modules.insert(address, module);
        self.stats.modules_created += 1;
        true
    }

    pub fn handle_wakeup(&mut self, fired: TimerFired) {
        self.stats.timer_wakeups += 1;
        let Some(module) = self.modules.get_mut(&fired.address) else {
            debug!(address = fired.address, "wake-up for dropped module");
            return;
        };
        let result = module.on_timer_fire(fired.generation);
        if let Some(count) = self.settle(fired.address, result) {
            self.stats.delayed_calls_fired += count as u64;
        }
    }

    pub fn handle_request(&mut self, request: GatewayRequest) {
        self.stats.requests += 1;
        match request {
            GatewayRequest::Dispatch {
                address,
                path,
                verb,
                body,
                reply,
            } => {
                let answer = self.dispatch(address, &path, verb, body);
                let _ = reply.send(answer);
            }
            GatewayRequest::Subscribe { reply } => {
                let _ = reply.send(Subscription {
                    snapshot: self.full_sync(),
                    patches: self.patches.subscribe(),
                });
            }
            GatewayRequest::Stats { reply } => {
                let _ = reply.send(self.stats.clone());
            }
        }
    }

    pub fn dispatch(&mut self, address: u8, path: &str, verb: Verb, body: Value) -> Reply {
        let Some(module) = self.modules.get_mut(&address) else {
            return Reply::text("Module not found\r\n").with_status(404);
        };
        debug!(address, %verb, path, "dispatching request");
        let result = module.dispatch(path, verb, body);
        match result {
            Ok(reply) => reply,
            Err(e) => {
                let status = match e {
                    ModuleError::Codec(_) | ModuleError::State(_) | ModuleError::UnknownSchema(_) => 400,
                    _ => 500,
                };
                let reply = Reply::text(format!("{e}\r\n")).with_status(status);
                self.settle::<()>(address, Err(e));
                reply
            }
        }
    }

    /// Log a module failure; a fatal one drops the runtime.
    fn settle<T>(&mut self, address: u8, result: Result<T, ModuleError>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(e) if e.is_fatal() => {
                error!(address, error = %e, "module faulted, dropping runtime");
                self.modules.remove(&address);
                self.stats.modules_faulted += 1;
                None
            }
            Err(e) => {
                warn!(address, error = %e, "module error");
                self.stats.module_errors += 1;
                None
            }
        }
    }
}
