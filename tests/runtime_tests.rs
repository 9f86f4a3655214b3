use chrono::{DateTime, Duration, Utc};
use futures::future::BoxFuture;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use velbus_gateway::messages::builtin_registry;
use velbus_gateway::module::{Module, ModuleContext, ModuleError, ModuleLogic, ModuleRuntime};
use velbus_gateway::patch::{apply, ObserverError, PatchOp};
use velbus_gateway::protocol::Frame;
use velbus_gateway::scheduler::{DelayedCall, SchedulerError, Timer, TimerHandle};
use velbus_gateway::schema::Message;
use velbus_gateway::OutboundFrame;

/// Armed timers that have not been cancelled.
#[derive(Clone, Default)]
struct CountingTimer {
    live: Arc<Mutex<Vec<(u64, DateTime<Utc>)>>>,
}

struct CountingHandle {
    generation: u64,
    live: Arc<Mutex<Vec<(u64, DateTime<Utc>)>>>,
}

impl TimerHandle for CountingHandle {
    fn cancel(self: Box<Self>) {
        self.live.lock().unwrap().retain(|(g, _)| *g != self.generation);
    }
}

impl Timer for CountingTimer {
    fn arm(&mut self, deadline: DateTime<Utc>, generation: u64) -> Result<Box<dyn TimerHandle>, SchedulerError> {
        self.live.lock().unwrap().push((generation, deadline));
        Ok(Box::new(CountingHandle {
            generation,
            live: Arc::clone(&self.live),
        }))
    }
}

#[derive(Debug)]
enum Step {
    Record(&'static str),
    /// Finishes only once the sender fires
    Wait(&'static str, oneshot::Receiver<()>, mpsc::UnboundedSender<&'static str>),
}

#[derive(Default)]
struct Recorder {
    fired: Vec<&'static str>,
}

impl ModuleLogic for Recorder {
    type Call = Step;

    fn kind(&self) -> &'static str {
        "Recorder"
    }

    fn on_message(&mut self, ctx: &mut ModuleContext<Step>, message: &Message) -> Result<(), ModuleError> {
        for (field, value) in message.fields() {
            ctx.state_mut()
                .set(["fields", field.name], field.field_type.value_to_json(value))?;
        }
        Ok(())
    }

    fn on_delayed_call(
        &mut self,
        _ctx: &mut ModuleContext<Step>,
        call: Step,
    ) -> Result<Option<BoxFuture<'static, ()>>, ModuleError> {
        match call {
            Step::Record(name) => {
                self.fired.push(name);
                Ok(None)
            }
            Step::Wait(name, gate, done) => {
                self.fired.push(name);
                Ok(Some(Box::pin(async move {
                    let _ = gate.await;
                    let _ = done.send(name);
                })))
            }
        }
    }
}

fn runtime(timer: CountingTimer) -> (ModuleRuntime<Recorder>, mpsc::UnboundedReceiver<OutboundFrame>) {
    let registry = Arc::new(builtin_registry().unwrap());
    let (tx, rx) = mpsc::unbounded_channel();
    (ModuleRuntime::new(Recorder::default(), 0x30, registry, Box::new(timer), tx), rx)
}

#[test]
fn test_past_calls_fire_in_order_future_call_stays_armed() {
    let timer = CountingTimer::default();
    let (mut module, _rx) = runtime(timer.clone());
    let now = Utc::now();
    let t1 = now - Duration::seconds(10);
    let t2 = now - Duration::seconds(5);
    let t3 = now + Duration::hours(1);

    let ctx = module.context_mut();
    ctx.schedule(DelayedCall::at(t3, Step::Record("t3"))).unwrap();
    ctx.schedule(DelayedCall::at(t2, Step::Record("t2"))).unwrap();
    ctx.schedule(DelayedCall::at(t1, Step::Record("t1"))).unwrap();

    assert_eq!(module.fire_due(now).unwrap(), 2);
    assert_eq!(module.logic().fired, ["t1", "t2"]);

    let live = timer.live.lock().unwrap();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].1, t3);
    assert_eq!(module.context().pending().count(), 1);
}

#[test]
fn test_replace_runs_only_new_plan() {
    let timer = CountingTimer::default();
    let (mut module, _rx) = runtime(timer.clone());
    let now = Utc::now();

    let ctx = module.context_mut();
    ctx.schedule(DelayedCall::at(now - Duration::seconds(3), Step::Record("old-a"))).unwrap();
    ctx.schedule(DelayedCall::at(now + Duration::seconds(30), Step::Record("old-b"))).unwrap();
    ctx.replace_schedule([
        DelayedCall::at(now - Duration::seconds(1), Step::Record("new-b")),
        DelayedCall::at(now - Duration::seconds(2), Step::Record("new-a")),
    ])
    .unwrap();

    module.fire_due(now + Duration::minutes(5)).unwrap();
    assert_eq!(module.logic().fired, ["new-a", "new-b"]);
    assert!(timer.live.lock().unwrap().is_empty());
    assert_eq!(module.context().scheduler_stats().total_superseded, 2);
}

#[test]
fn test_naive_and_utc_schedule_identically() {
    let now = Utc::now();
    let when = now + Duration::seconds(90);

    let naive_timer = CountingTimer::default();
    let (mut naive, _rx1) = runtime(naive_timer.clone());
    naive
        .context_mut()
        .schedule(DelayedCall::at(when.naive_utc(), Step::Record("x")))
        .unwrap();

    let utc_timer = CountingTimer::default();
    let (mut utc, _rx2) = runtime(utc_timer.clone());
    utc.context_mut()
        .schedule(DelayedCall::at(when, Step::Record("x")))
        .unwrap();

    assert_eq!(*naive_timer.live.lock().unwrap(), *utc_timer.live.lock().unwrap());
    for module in [&mut naive, &mut utc] {
        assert_eq!(module.fire_due(when - Duration::milliseconds(1)).unwrap(), 0);
        assert_eq!(module.fire_due(when).unwrap(), 1);
    }
}

#[tokio::test]
async fn test_async_delayed_work_is_detached() {
    let (mut module, _rx) = runtime(CountingTimer::default());
    let (gate_tx, gate_rx) = oneshot::channel();
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    let now = Utc::now();

    let ctx = module.context_mut();
    ctx.schedule(DelayedCall::at(now, Step::Wait("slow", gate_rx, done_tx))).unwrap();
    ctx.schedule(DelayedCall::at(now, Step::Record("after"))).unwrap();

    // The firing loop does not wait for the slow work
    assert_eq!(module.fire_due(now).unwrap(), 2);
    assert_eq!(module.logic().fired, ["slow", "after"]);
    assert_eq!(module.running_tasks(), 1);
    assert!(done_rx.try_recv().is_err());

    gate_tx.send(()).unwrap();
    assert_eq!(done_rx.recv().await, Some("slow"));
}

#[test]
fn test_patch_history_replays_to_state() {
    let (mut module, _rx) = runtime(CountingTimer::default());
    let registry = builtin_registry().unwrap();
    let history = Arc::new(Mutex::new(Vec::<PatchOp>::new()));
    let sink = Arc::clone(&history);
    module.subscribe(Box::new(move |ops: &[PatchOp]| -> Result<(), ObserverError> {
        sink.lock().unwrap().extend_from_slice(ops);
        Ok(())
    }));

    for payload in [[0x01, 0, 0, 0], [0x03, 0xff, 0, 0], [0x03, 0xff, 0, 0], [0x00, 0, 0x10, 0]] {
        let frame = Frame::new(0x30, 0xed, &payload).unwrap();
        module.handle_message(&registry.decode(&frame).unwrap()).unwrap();
    }

    let mut replayed = json!({});
    for op in history.lock().unwrap().iter() {
        apply(&mut replayed, op).unwrap();
    }
    assert_eq!(&replayed, module.state());
    assert_eq!(
        module.state().pointer("/fields/leds_slow_blink"),
        Some(&Value::Array(
            (0..8).map(|i| Value::Bool(i == 4)).collect()
        ))
    );
}

#[test]
fn test_late_subscriber_gets_full_sync() {
    let (mut module, _rx) = runtime(CountingTimer::default());
    let registry = builtin_registry().unwrap();
    let frame = Frame::new(0x30, 0xed, &[0x01, 0, 0, 0]).unwrap();
    module.handle_message(&registry.decode(&frame).unwrap()).unwrap();

    let initial = Arc::new(Mutex::new(Vec::<PatchOp>::new()));
    let sink = Arc::clone(&initial);
    module.subscribe(Box::new(move |ops: &[PatchOp]| -> Result<(), ObserverError> {
        sink.lock().unwrap().extend_from_slice(ops);
        Ok(())
    }));

    let mut replayed = json!({});
    for op in initial.lock().unwrap().iter() {
        apply(&mut replayed, op).unwrap();
    }
    assert_eq!(&replayed, module.state());
}
