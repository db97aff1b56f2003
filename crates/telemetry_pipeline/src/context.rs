//! Context Carrier
//!
//! Correlation state (trace id, span id, baggage) lives in a thread-local slot,
//! one per execution unit. Nothing here is shared across threads, so context
//! propagation never takes a lock. When a span is entered through
//! [`SpanHandle::enter`], its handle rides along in the same slot so deeper
//! frames can reach it with [`crate::tracer::current_span`].
//!
//! # Crossing async boundaries
//!
//! Tasks do not inherit the spawning thread's context. A snapshot is captured
//! at spawn time and re-entered on every poll of the spawned future:
//!
//! ```rust,ignore
//! use telemetry_pipeline::context::{self, FutureExt};
//!
//! let _guard = context::enter(parent_cx);
//! // Captures the current context now, re-enters it inside the task.
//! tokio::spawn(async { /* context::current() == Some(parent_cx) */ }.with_current_context());
//! // Or equivalently:
//! context::spawn(async { /* ... */ });
//! ```

use crate::tracer::SpanHandle;
use pin_project_lite::pin_project;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::task::{Context, Poll};

/// User-defined key/value pairs propagated alongside trace context.
pub type Baggage = BTreeMap<String, String>;

/// Correlation identity of one span within a trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceContext {
    /// Unique trace identifier (128-bit), immutable for the life of the trace
    #[serde(with = "hex_id::trace")]
    pub trace_id: u128,
    /// Span identifier (64-bit), unique within the trace
    #[serde(with = "hex_id::span")]
    pub span_id: u64,
    /// Parent span identifier (`None` for a root span)
    #[serde(with = "hex_id::parent", default)]
    pub parent_span_id: Option<u64>,
    /// Sampling decision, inherited by children
    pub sampled: bool,
    /// Propagated baggage
    pub baggage: Baggage,
}

impl TraceContext {
    /// Starts a brand new trace.
    pub fn new_root(sampled: bool) -> Self {
        Self {
            trace_id: generate_trace_id(),
            span_id: generate_span_id(),
            parent_span_id: None,
            sampled,
            baggage: Baggage::new(),
        }
    }

    /// Derives a child context: same trace and baggage, fresh span id, this span as parent.
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id,
            span_id: generate_span_id(),
            parent_span_id: Some(self.span_id),
            sampled: self.sampled,
            baggage: self.baggage.clone(),
        }
    }

    pub fn with_baggage(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.baggage.insert(key.into(), value.into());
        self
    }

    /// 32 lowercase hex digits.
    pub fn trace_id_hex(&self) -> String {
        format!("{:032x}", self.trace_id)
    }

    /// 16 lowercase hex digits.
    pub fn span_id_hex(&self) -> String {
        format!("{:016x}", self.span_id)
    }
}

/// Ids are serialized as fixed-width lowercase hex, as on the wire.
pub(crate) mod hex_id {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub mod trace {
        use super::*;

        pub fn serialize<S: Serializer>(id: &u128, s: S) -> Result<S::Ok, S::Error> {
            s.serialize_str(&format!("{id:032x}"))
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<u128, D::Error> {
            let text = String::deserialize(d)?;
            u128::from_str_radix(&text, 16).map_err(D::Error::custom)
        }
    }

    pub mod span {
        use super::*;

        pub fn serialize<S: Serializer>(id: &u64, s: S) -> Result<S::Ok, S::Error> {
            s.serialize_str(&format!("{id:016x}"))
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
            let text = String::deserialize(d)?;
            u64::from_str_radix(&text, 16).map_err(D::Error::custom)
        }
    }

    pub mod parent {
        use super::*;

        pub fn serialize<S: Serializer>(id: &Option<u64>, s: S) -> Result<S::Ok, S::Error> {
            match id {
                Some(id) => s.serialize_str(&format!("{id:016x}")),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u64>, D::Error> {
            Option::<String>::deserialize(d)?
                .map(|text| u64::from_str_radix(&text, 16).map_err(D::Error::custom))
                .transpose()
        }
    }
}

/// Generates a random non-zero 128-bit trace id.
pub fn generate_trace_id() -> u128 {
    let mut rng = rand::thread_rng();
    loop {
        let id = ((rng.next_u64() as u128) << 64) | rng.next_u64() as u128;
        if id != 0 {
            return id;
        }
    }
}

/// Generates a random non-zero 64-bit span id.
pub fn generate_span_id() -> u64 {
    let mut rng = rand::thread_rng();
    loop {
        let id = rng.next_u64();
        if id != 0 {
            return id;
        }
    }
}

/// What an execution unit has active.
#[derive(Clone)]
struct Frame {
    cx: TraceContext,
    span: Option<SpanHandle>,
}

thread_local! {
    static CURRENT: RefCell<Option<Frame>> = const { RefCell::new(None) };
}

/// Returns the active context of this execution unit, or `None` when no trace is active.
pub fn current() -> Option<TraceContext> {
    CURRENT
        .try_with(|slot| slot.borrow().as_ref().map(|frame| frame.cx.clone()))
        .ok()
        .flatten()
}

/// Handle of the span entered in this execution unit, if any.
pub(crate) fn current_span() -> Option<SpanHandle> {
    CURRENT
        .try_with(|slot| slot.borrow().as_ref().and_then(|frame| frame.span.clone()))
        .ok()
        .flatten()
}

fn current_frame() -> Option<Frame> {
    CURRENT.try_with(|slot| slot.borrow().clone()).ok().flatten()
}

/// Makes `cx` the active context until the returned guard is dropped.
///
/// The guard restores whatever was active before, on every exit path
/// (including unwinding). It is `!Send`: a guard belongs to the frame that
/// created it.
pub fn enter(cx: TraceContext) -> ContextGuard {
    enter_frame(Some(Frame { cx, span: None }))
}

/// Activates `span` (context and handle). `None` for an unstarted handle.
pub(crate) fn enter_span(span: &SpanHandle) -> Option<ContextGuard> {
    let frame = span_frame(span)?;
    Some(enter_frame(Some(frame)))
}

fn span_frame(span: &SpanHandle) -> Option<Frame> {
    span.context().map(|cx| Frame {
        cx: cx.clone(),
        span: Some(span.clone()),
    })
}

fn enter_frame(frame: Option<Frame>) -> ContextGuard {
    let previous = replace_current(frame);
    ContextGuard {
        previous,
        _not_send: PhantomData,
    }
}

fn replace_current(next: Option<Frame>) -> Option<Frame> {
    CURRENT
        .try_with(|slot| std::mem::replace(&mut *slot.borrow_mut(), next))
        .ok()
        .flatten()
}

/// Scoped activation of a [`TraceContext`]; see [`enter`].
#[must_use = "the context is exited as soon as the guard is dropped"]
pub struct ContextGuard {
    previous: Option<Frame>,
    _not_send: PhantomData<*const ()>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        replace_current(self.previous.take());
    }
}

/// Runs `f` with `cx` active.
pub fn with<R>(cx: TraceContext, f: impl FnOnce() -> R) -> R {
    let _guard = enter(cx);
    f()
}

pin_project! {
    /// Future that re-enters a captured context on every poll.
    pub struct WithContext<F> {
        #[pin]
        inner: F,
        frame: Option<Frame>,
    }
}

impl<F: Future> Future for WithContext<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, task_cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        // An empty snapshot still shadows whatever the polling thread has active.
        let _guard = enter_frame(this.frame.clone());
        this.inner.poll(task_cx)
    }
}

/// Explicit context capture for futures.
pub trait FutureExt: Future + Sized {
    /// Attaches `cx`; it is active whenever the future is polled.
    fn with_context(self, cx: TraceContext) -> WithContext<Self> {
        WithContext {
            inner: self,
            frame: Some(Frame { cx, span: None }),
        }
    }

    /// Captures the caller's current context (possibly none) as the future's context.
    fn with_current_context(self) -> WithContext<Self> {
        WithContext {
            inner: self,
            frame: current_frame(),
        }
    }

    /// Attaches `span`, handle included. An unstarted handle falls back to
    /// the caller's current context.
    fn with_span(self, span: &SpanHandle) -> WithContext<Self> {
        WithContext {
            inner: self,
            frame: span_frame(span).or_else(current_frame),
        }
    }
}

impl<F: Future> FutureExt for F {}

/// Spawns `future` on the Tokio runtime with the caller's context captured at spawn time.
pub fn spawn<F>(future: F) -> tokio::task::JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::spawn(future.with_current_context())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_is_empty_by_default() {
        assert!(current().is_none());
    }

    #[test]
    fn test_enter_restores_previous_on_drop() {
        let outer = TraceContext::new_root(true);
        let inner = outer.child();
        {
            let _g1 = enter(outer.clone());
            assert_eq!(current(), Some(outer.clone()));
            {
                let _g2 = enter(inner.clone());
                assert_eq!(current(), Some(inner));
            }
            assert_eq!(current(), Some(outer));
        }
        assert!(current().is_none());
    }

    #[test]
    fn test_guard_restores_on_panic() {
        let cx = TraceContext::new_root(true);
        let result = std::panic::catch_unwind(|| {
            let _g = enter(cx);
            panic!("boom");
        });
        assert!(result.is_err());
        assert!(current().is_none());
    }

    #[test]
    fn test_child_inherits_trace_and_baggage() {
        let root = TraceContext::new_root(true).with_baggage("tenant", "acme");
        let child = root.child();
        assert_eq!(child.trace_id, root.trace_id);
        assert_eq!(child.parent_span_id, Some(root.span_id));
        assert_ne!(child.span_id, root.span_id);
        assert_eq!(child.baggage.get("tenant").map(String::as_str), Some("acme"));
    }

    #[test]
    fn test_hex_formatting() {
        let cx = TraceContext {
            trace_id: 0xabc,
            span_id: 0x1f,
            parent_span_id: None,
            sampled: true,
            baggage: Baggage::new(),
        };
        assert_eq!(cx.trace_id_hex(), "00000000000000000000000000000abc");
        assert_eq!(cx.span_id_hex(), "000000000000001f");
    }

    #[test]
    fn test_ids_serialize_as_hex() {
        let cx = TraceContext {
            trace_id: 0xabc,
            span_id: 0x1f,
            parent_span_id: Some(0x2),
            sampled: true,
            baggage: Baggage::new(),
        };
        let json = serde_json::to_value(&cx).unwrap();
        assert_eq!(json["trace_id"], "00000000000000000000000000000abc");
        assert_eq!(json["parent_span_id"], "0000000000000002");
        let back: TraceContext = serde_json::from_value(json).unwrap();
        assert_eq!(back, cx);
    }

    #[test]
    fn test_threads_do_not_share_context() {
        let _g = enter(TraceContext::new_root(true));
        let seen = std::thread::spawn(current).join().unwrap();
        assert!(seen.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_spawn_captures_snapshot() {
        let cx = TraceContext::new_root(true);
        let handle = {
            let _g = enter(cx.clone());
            spawn(async {
                tokio::task::yield_now().await;
                current()
            })
        };
        assert_eq!(handle.await.unwrap(), Some(cx));
    }
}
