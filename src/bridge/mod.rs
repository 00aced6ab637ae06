//! Host bridge: the fixed primitive set injected into the sandbox.
//!
//! Scripts see exactly two globals, `host` and `context`. The `host` object
//! carries structured logging, clock reads, hashing, allow-listed
//! environment reads, secret lookup, webhook enqueue, the safe outbound
//! fetch with its single-slot async result channel, and nested span
//! declaration. The set is fixed; there is no dynamic extension point.

pub mod fetch;

pub use fetch::{domain_matches, FetchError, FetchOptions, FetchPolicy, SafeFetcher};

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use boa_engine::object::ObjectInitializer;
use boa_engine::property::Attribute;
use boa_engine::{js_string, Context, JsNativeError, JsResult, JsValue, NativeFunction};
use chrono::{SecondsFormat, Utc};
use md5::Md5;
use serde_json::Value;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::model::{Span, SpanStatus};
use crate::trace::{SpanRecorder, SpanScope, NESTED_SPAN_DEPTH_CAP};

/// Read-only process-wide bridge configuration, immutable from the sandbox.
#[derive(Debug, Clone, Default)]
pub struct HostBridgeConfig {
    /// Environment keys scripts may read; everything else returns null.
    pub env_allowlist: Vec<String>,
    /// Named secrets scripts may look up; unknown names return null.
    pub secrets: HashMap<String, String>,
    pub fetch: FetchPolicy,
}

/// A webhook enqueued from a script. Delivery is out of scope.
#[derive(Debug, Clone)]
pub struct WebhookEvent {
    pub url: String,
    pub payload: Value,
    pub enqueued_at: chrono::DateTime<Utc>,
}

/// Fire-and-forget hand-off channel for script-enqueued webhooks.
#[derive(Clone)]
pub struct WebhookQueue {
    tx: mpsc::UnboundedSender<WebhookEvent>,
}

impl WebhookQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<WebhookEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue with no consumer; enqueued events are discarded.
    pub fn detached() -> Self {
        let (queue, _rx) = Self::new();
        queue
    }

    pub fn enqueue(&self, event: WebhookEvent) -> bool {
        match self.tx.send(event) {
            Ok(()) => true,
            Err(_) => {
                tracing::debug!("webhook queue has no consumer; event dropped");
                false
            }
        }
    }
}

/// Bridge shared across runs. Per-invocation state (the async result slot
/// and the open-span stack) is created inside [`HostBridge::install`] so
/// concurrent sibling scripts never share mutable state.
pub struct HostBridge {
    config: Arc<HostBridgeConfig>,
    fetcher: Arc<SafeFetcher>,
    webhooks: WebhookQueue,
}

impl HostBridge {
    pub fn new(config: HostBridgeConfig, webhooks: WebhookQueue) -> Result<Self, FetchError> {
        let fetcher = Arc::new(SafeFetcher::new(config.fetch.clone())?);
        Ok(Self {
            config: Arc::new(config),
            fetcher,
            webhooks,
        })
    }

    /// Registers the `host` global into a fresh sandbox context.
    pub(crate) fn install(
        &self,
        context: &mut Context,
        scope: SpanScope,
        recorder: Arc<SpanRecorder>,
        runtime: Handle,
    ) -> JsResult<()> {
        // One-shot side channel for the last async host-call result, owned
        // by this invocation alone.
        let slot: Rc<RefCell<Option<Value>>> = Rc::new(RefCell::new(None));
        // Stack of currently open spans, rooted at the script's own span.
        let open_spans: Rc<RefCell<Vec<Uuid>>> =
            Rc::new(RefCell::new(vec![scope.script_span_id]));

        let env_allowlist = self.config.env_allowlist.clone();
        // SAFETY: the closures below capture no engine-managed (GC) values.
        let env_fn = unsafe {
            NativeFunction::from_closure(move |_this, args, _ctx| {
                let key = js_arg_to_string(args.first());
                if !env_allowlist.iter().any(|k| k == &key) {
                    return Ok(JsValue::null());
                }
                match std::env::var(&key) {
                    Ok(value) => Ok(JsValue::from(js_string!(value))),
                    Err(_) => Ok(JsValue::null()),
                }
            })
        };

        let secrets = self.config.secrets.clone();
        let secret_fn = unsafe {
            NativeFunction::from_closure(move |_this, args, _ctx| {
                let name = js_arg_to_string(args.first());
                match secrets.get(&name) {
                    Some(value) => Ok(JsValue::from(js_string!(value.clone()))),
                    None => Ok(JsValue::null()),
                }
            })
        };

        let webhooks = self.webhooks.clone();
        let webhook_fn = unsafe {
            NativeFunction::from_closure(move |_this, args, ctx| {
                let url = js_arg_to_string(args.first());
                if url.is_empty() {
                    return Err(JsNativeError::typ()
                        .with_message("enqueueWebhook expects a url")
                        .into());
                }
                let payload = match args.get(1) {
                    Some(v) if !v.is_undefined() => v.to_json(ctx)?,
                    _ => Value::Null,
                };
                let accepted = webhooks.enqueue(WebhookEvent {
                    url,
                    payload,
                    enqueued_at: Utc::now(),
                });
                Ok(JsValue::from(accepted))
            })
        };

        let fetcher = self.fetcher.clone();
        let fetch_slot = slot.clone();
        let fetch_fn = unsafe {
            NativeFunction::from_closure(move |_this, args, ctx| {
                let raw = js_arg_to_string(args.first());
                let url = fetcher
                    .check_url(&raw)
                    .map_err(|e| JsNativeError::typ().with_message(e.to_string()))?;
                let opts = match args.get(1) {
                    Some(v) if v.is_object() => FetchOptions::from_json(&v.to_json(ctx)?),
                    _ => FetchOptions::default(),
                };
                // The script suspends here: the interpreter thread parks on
                // the host future and resumes once the call settles.
                let sanitized = runtime.block_on(fetcher.fetch(url, opts));
                *fetch_slot.borrow_mut() = Some(sanitized.clone());
                JsValue::from_json(&sanitized, ctx)
            })
        };

        let await_slot = slot;
        let await_fn = unsafe {
            NativeFunction::from_closure(move |_this, _args, ctx| {
                match await_slot.borrow_mut().take() {
                    Some(value) => JsValue::from_json(&value, ctx),
                    None => Ok(JsValue::null()),
                }
            })
        };

        let span_fn = unsafe {
            NativeFunction::from_closure(move |_this, args, ctx| {
                let name = js_arg_to_string(args.first());
                let (attrs_arg, callback_arg) = if args.len() >= 3 {
                    (args.get(1), args.get(2))
                } else {
                    (None, args.get(1))
                };
                let callback = callback_arg
                    .and_then(|v| v.as_callable())
                    .cloned()
                    .ok_or_else(|| {
                        JsNativeError::typ().with_message("host.span expects a callback")
                    })?;
                let attributes = match attrs_arg {
                    Some(v) if v.is_object() => v.to_json(ctx).ok(),
                    _ => None,
                };

                let parent_span_id = open_spans
                    .borrow()
                    .last()
                    .copied()
                    .unwrap_or(scope.script_span_id);
                // Levels below the script span before this one opens.
                let depth = open_spans.borrow().len();
                let span_id = Uuid::new_v4();
                let started_at = Utc::now();

                open_spans.borrow_mut().push(span_id);
                let result = callback.call(&JsValue::undefined(), &[], ctx);
                open_spans.borrow_mut().pop();

                // The body always runs; only spans within the cap leave a
                // record.
                if depth <= NESTED_SPAN_DEPTH_CAP {
                    let ended_at = Utc::now();
                    let (status, status_message) = match &result {
                        Ok(_) => (SpanStatus::Success, None),
                        Err(err) => (SpanStatus::Error, Some(err.to_string())),
                    };
                    recorder.record(Span {
                        id: span_id,
                        trace_id: scope.trace_id,
                        script_id: Some(scope.script_id.clone()),
                        name,
                        layer_index: scope.layer_index,
                        parallel_index: scope.parallel_index,
                        status,
                        status_message,
                        started_at,
                        ended_at,
                        duration_ms: (ended_at - started_at).num_milliseconds().max(0) as u64,
                        attributes,
                        parent_span_id: Some(parent_span_id),
                    });
                }
                result
            })
        };

        let mut initializer = ObjectInitializer::new(context);
        initializer
            .function(NativeFunction::from_fn_ptr(host_log), js_string!("log"), 2)
            .function(NativeFunction::from_fn_ptr(host_now), js_string!("now"), 0)
            .function(
                NativeFunction::from_fn_ptr(host_now_iso),
                js_string!("nowIso"),
                0,
            )
            .function(NativeFunction::from_fn_ptr(host_hash), js_string!("hash"), 2)
            .function(env_fn, js_string!("env"), 1)
            .function(secret_fn, js_string!("secret"), 1)
            .function(webhook_fn, js_string!("enqueueWebhook"), 2)
            .function(fetch_fn, js_string!("fetch"), 2)
            .function(await_fn, js_string!("awaitResult"), 0)
            .function(span_fn, js_string!("span"), 3);
        let host = initializer.build();

        context.register_global_property(js_string!("host"), host, Attribute::all())?;
        Ok(())
    }
}

fn host_log(_this: &JsValue, args: &[JsValue], _ctx: &mut Context) -> JsResult<JsValue> {
    let level = js_arg_to_string(args.first());
    let message = js_arg_to_string(args.get(1));
    match level.as_str() {
        "error" => tracing::error!(target: "flowgate::script", "{}", message),
        "warn" => tracing::warn!(target: "flowgate::script", "{}", message),
        "debug" => tracing::debug!(target: "flowgate::script", "{}", message),
        _ => tracing::info!(target: "flowgate::script", "{}", message),
    }
    Ok(JsValue::undefined())
}

fn host_now(_this: &JsValue, _args: &[JsValue], _ctx: &mut Context) -> JsResult<JsValue> {
    Ok(JsValue::from(Utc::now().timestamp_millis()))
}

fn host_now_iso(_this: &JsValue, _args: &[JsValue], _ctx: &mut Context) -> JsResult<JsValue> {
    let iso = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
    Ok(JsValue::from(js_string!(iso)))
}

fn host_hash(_this: &JsValue, args: &[JsValue], _ctx: &mut Context) -> JsResult<JsValue> {
    let algorithm = js_arg_to_string(args.first());
    let data = js_arg_to_string(args.get(1));
    let digest = match algorithm.as_str() {
        "md5" => {
            let mut hasher = Md5::new();
            hasher.update(data.as_bytes());
            hex::encode(hasher.finalize())
        }
        "sha1" => {
            let mut hasher = Sha1::new();
            hasher.update(data.as_bytes());
            hex::encode(hasher.finalize())
        }
        "sha256" => {
            let mut hasher = Sha256::new();
            hasher.update(data.as_bytes());
            hex::encode(hasher.finalize())
        }
        "sha512" => {
            let mut hasher = Sha512::new();
            hasher.update(data.as_bytes());
            hex::encode(hasher.finalize())
        }
        other => {
            return Err(JsNativeError::typ()
                .with_message(format!("unsupported hash algorithm: {other}"))
                .into())
        }
    };
    Ok(JsValue::from(js_string!(digest)))
}

fn js_arg_to_string(arg: Option<&JsValue>) -> String {
    arg.and_then(|v| v.as_string())
        .map(|s| s.to_std_string_escaped())
        .unwrap_or_default()
}
