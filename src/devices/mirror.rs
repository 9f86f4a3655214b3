use chrono::{DateTime, NaiveDateTime, Utc};
use futures::future::BoxFuture;
use serde_json::{json, Value};

use crate::messages::sensor_settings::SENSOR_SETTINGS_REQUEST;
use crate::module::{ModuleContext, ModuleError, ModuleLogic, Reply, Request, RouteTable, Verb};
use crate::patch::Path;
use crate::scheduler::{DelayedCall, FireTime};
use crate::schema::Message;

const MESSAGES: &str = "messages";

/// Longest accepted refresh delay: one year.
const MAX_DELAY_SECS: f64 = 365.0 * 24.0 * 3600.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorCall {
    /// Ask the module to resend its settings
    Refresh,
}

/// Generic device: every decoded field lands at
/// `messages/<schema>/<field>` in the state tree.
#[derive(Debug, Default)]
pub struct Mirror {
    received: u64,
}

impl Mirror {
    pub fn received(&self) -> u64 {
        self.received
    }
}

/// `{"delay": seconds}`, `{"at": timestamp}` or nothing for "now".
/// Timestamps without an offset are UTC.
fn fire_time(body: &Value) -> Result<FireTime, String> {
    if let Some(delay) = body.get("delay") {
        let seconds = delay
            .as_f64()
            .filter(|s| s.is_finite() && *s >= 0.0)
            .ok_or("`delay` must be a non-negative number of seconds")?;
        if seconds > MAX_DELAY_SECS {
            return Err(format!("`delay` may not exceed {MAX_DELAY_SECS} seconds"));
        }
        return chrono::Duration::try_milliseconds((seconds * 1000.0).round() as i64)
            .and_then(|delay| Utc::now().checked_add_signed(delay))
            .map(FireTime::Utc)
            .ok_or_else(|| "`delay` is out of range".to_string());
    }
    match body.get("at") {
        None => Ok(FireTime::Now),
        Some(Value::String(text)) => DateTime::parse_from_rfc3339(text)
            .map(FireTime::Fixed)
            .or_else(|_| text.parse::<NaiveDateTime>().map(FireTime::Naive))
            .map_err(|e| format!("invalid `at` timestamp: {e}")),
        Some(_) => Err("`at` must be a timestamp string".to_string()),
    }
}

fn get_state(
    _: &mut Mirror,
    ctx: &mut ModuleContext<MirrorCall>,
    request: &Request,
) -> Result<Reply, ModuleError> {
    let pointer = if request.path_info.is_empty() {
        String::new()
    } else {
        format!("/{}", request.path_info)
    };
    let Ok(path) = Path::from_pointer(&pointer) else {
        return Ok(Reply::not_found());
    };
    Ok(ctx
        .state()
        .get(&path)
        .map(|value| Reply::json(value.clone()))
        .unwrap_or_else(Reply::not_found))
}

fn post_refresh(
    _: &mut Mirror,
    ctx: &mut ModuleContext<MirrorCall>,
    request: &Request,
) -> Result<Reply, ModuleError> {
    if !request.path_info.is_empty() {
        return Ok(Reply::not_found());
    }
    let when = match fire_time(&request.body) {
        Ok(when) => when,
        Err(reason) => return Ok(Reply::bad_request(reason)),
    };
    ctx.schedule(DelayedCall::at(when, MirrorCall::Refresh))?;
    Ok(Reply::text("Refresh scheduled\r\n").with_status(202))
}

fn get_delayed(
    _: &mut Mirror,
    ctx: &mut ModuleContext<MirrorCall>,
    _: &Request,
) -> Result<Reply, ModuleError> {
    let pending: Vec<Value> = ctx
        .pending()
        .map(|(when, call)| json!({"when": when.to_rfc3339(), "call": format!("{call:?}")}))
        .collect();
    Ok(Reply::json(Value::Array(pending)))
}

fn delete_delayed(
    _: &mut Mirror,
    ctx: &mut ModuleContext<MirrorCall>,
    _: &Request,
) -> Result<Reply, ModuleError> {
    ctx.clear_schedule();
    Ok(Reply::text("Cleared\r\n"))
}

impl ModuleLogic for Mirror {
    type Call = MirrorCall;

    fn kind(&self) -> &'static str {
        "Mirror"
    }

    fn routes(routes: &mut RouteTable<Self>) {
        routes
            .add("state", Verb::Get, get_state)
            .add("refresh", Verb::Post, post_refresh)
            .add("delayed", Verb::Get, get_delayed)
            .add("delayed", Verb::Delete, delete_delayed);
    }

    fn on_message(
        &mut self,
        ctx: &mut ModuleContext<MirrorCall>,
        message: &Message,
    ) -> Result<(), ModuleError> {
        self.received += 1;
        for (field, value) in message.fields() {
            let path = Path::root().key(MESSAGES).key(message.name()).key(field.name);
            ctx.state_mut().set(path, field.field_type.value_to_json(value))?;
        }
        if message.fields().next().is_none() {
            let path = Path::root().key(MESSAGES).key(message.name());
            ctx.state_mut().set(path, json!({}))?;
        }
        Ok(())
    }

    fn on_delayed_call(
        &mut self,
        ctx: &mut ModuleContext<MirrorCall>,
        call: MirrorCall,
    ) -> Result<Option<BoxFuture<'static, ()>>, ModuleError> {
        match call {
            MirrorCall::Refresh => {
                ctx.send(&ctx.message(SENSOR_SETTINGS_REQUEST)?)?;
                ctx.state_mut().set(["last_refresh"], Utc::now().to_rfc3339())?;
            }
        }
        Ok(None)
    }
}
