//! Instrumentation API for spans.
//!
//! A [`SpanHandle`] owns the span while it is open. Any clone of the handle
//! may mutate it; `end()` moves the finished span out, masks it and submits
//! it to the export pipeline exactly once. Operations on an ended (or never
//! started) span are misuse: they are ignored and reported through `tracing`,
//! never raised.

use crate::attribute::{AttributeValue, Attributes};
use crate::config::SpanLimits;
use crate::context::{self, ContextGuard, TraceContext};
use crate::error::Misuse;
use crate::invariants::debug_assert_span_ended;
use crate::masking::{MaskingRules, mask_span};
use crate::pipeline::RecordSink;
use crate::record::{BatchItem, now_unix_nanos};
use crate::sampler::Sampler;
use crate::span::{ExceptionRecord, Span, SpanEvent, SpanKind, SpanStatus};
use parking_lot::Mutex;
use std::ops::Deref;
use std::sync::Arc;

/// Name of the event added by [`SpanHandle::record_exception`].
pub const EXCEPTION_EVENT: &str = "exception";

/// The span most recently entered (via [`SpanHandle::enter`] or a
/// [`SpanGuard`]) in this execution unit.
///
/// A context entered directly with [`context::enter`] carries no handle, so
/// this returns `None` there even though [`context::current`] does not.
pub fn current_span() -> Option<SpanHandle> {
    context::current_span()
}

/// Runs `f` against the current span, or reports misuse when there is none.
pub(crate) fn with_current_span(operation: &'static str, f: impl FnOnce(&SpanHandle)) {
    match current_span() {
        Some(span) => f(&span),
        None => Misuse::NoActiveSpan { operation }.report(),
    }
}

struct TracerInner {
    sampler: Box<dyn Sampler>,
    limits: SpanLimits,
    masking: MaskingRules,
    sink: Arc<dyn RecordSink>,
}

/// Creates spans and routes finished ones to the export pipeline. Cheap to clone.
#[derive(Clone)]
pub struct Tracer {
    inner: Arc<TracerInner>,
}

impl Tracer {
    pub fn new(
        sampler: Box<dyn Sampler>,
        limits: SpanLimits,
        masking: MaskingRules,
        sink: Arc<dyn RecordSink>,
    ) -> Self {
        Self {
            inner: Arc::new(TracerInner {
                sampler,
                limits,
                masking,
                sink,
            }),
        }
    }

    /// Starts an `Internal` span as a child of the active context (or a new root).
    pub fn start_span(&self, name: impl Into<String>) -> SpanHandle {
        self.span_builder(name).start()
    }

    pub fn span_builder(&self, name: impl Into<String>) -> SpanBuilder<'_> {
        SpanBuilder {
            tracer: self,
            name: name.into(),
            kind: SpanKind::Internal,
            attributes: Attributes::new(),
            parent: ParentChoice::Current,
        }
    }

    /// Runs `f` inside a scoped span; the span ends when `f` returns or unwinds.
    pub fn in_span<R>(&self, name: impl Into<String>, f: impl FnOnce(&SpanHandle) -> R) -> R {
        let guard = self.span_builder(name).start_scoped();
        f(&guard)
    }
}

enum ParentChoice {
    Current,
    Explicit(TraceContext),
    Root,
}

/// Configures a span before starting it.
pub struct SpanBuilder<'a> {
    tracer: &'a Tracer,
    name: String,
    kind: SpanKind,
    attributes: Attributes,
    parent: ParentChoice,
}

impl SpanBuilder<'_> {
    pub fn with_kind(mut self, kind: SpanKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_attributes(mut self, attributes: Attributes) -> Self {
        self.attributes.extend(attributes);
        self
    }

    /// Uses `parent` instead of the active context (e.g. extracted from headers).
    pub fn with_parent(mut self, parent: TraceContext) -> Self {
        self.parent = ParentChoice::Explicit(parent);
        self
    }

    /// Starts a new trace even if a context is active.
    pub fn as_root(mut self) -> Self {
        self.parent = ParentChoice::Root;
        self
    }

    pub fn start(self) -> SpanHandle {
        let inner = &self.tracer.inner;
        let parent = match self.parent {
            ParentChoice::Current => context::current(),
            ParentChoice::Explicit(cx) => Some(cx),
            ParentChoice::Root => None,
        };
        let mut cx = match &parent {
            Some(p) => p.child(),
            None => TraceContext::new_root(true),
        };
        cx.sampled = inner.sampler.should_sample(parent.as_ref(), cx.trace_id, &self.name);

        let mut span = Span::new(cx.clone(), self.name, self.kind);
        for (key, value) in self.attributes {
            put_attribute(&mut span, &inner.limits, key, value);
        }

        SpanHandle {
            state: Arc::new(Mutex::new(Lifecycle::Open(Box::new(span)))),
            context: Some(cx),
            tracer: Some(Arc::clone(inner)),
        }
    }

    /// Starts the span and enters its context until the guard drops.
    pub fn start_scoped(self) -> SpanGuard {
        SpanGuard::new(self.start())
    }
}

enum Lifecycle {
    Unstarted,
    Open(Box<Span>),
    Ended { name: String },
}

/// Shared handle on one span. Clones refer to the same span.
///
/// The [`Default`] handle is unstarted; every operation on it is ignored.
#[derive(Clone)]
pub struct SpanHandle {
    state: Arc<Mutex<Lifecycle>>,
    context: Option<TraceContext>,
    tracer: Option<Arc<TracerInner>>,
}

impl Default for SpanHandle {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(Lifecycle::Unstarted)),
            context: None,
            tracer: None,
        }
    }
}

impl std::fmt::Debug for SpanHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpanHandle")
            .field("context", &self.context)
            .field("ended", &self.is_ended())
            .finish()
    }
}

fn put_attribute(span: &mut Span, limits: &SpanLimits, key: String, value: AttributeValue) {
    if span.attributes.len() < limits.max_attributes || span.attributes.contains_key(&key) {
        span.attributes.insert(key, value);
    } else {
        span.dropped_attributes_count = span.dropped_attributes_count.saturating_add(1);
    }
}

fn put_event(span: &mut Span, limits: &SpanLimits, event: SpanEvent) {
    if span.events.len() < limits.max_events {
        span.events.push(event);
    } else {
        span.dropped_events_count = span.dropped_events_count.saturating_add(1);
    }
}

impl SpanHandle {
    /// Context of this span; `None` for an unstarted handle.
    pub fn context(&self) -> Option<&TraceContext> {
        self.context.as_ref()
    }

    /// True while open and sampled.
    pub fn is_recording(&self) -> bool {
        self.context.as_ref().is_some_and(|cx| cx.sampled) && !self.is_ended()
    }

    pub fn is_ended(&self) -> bool {
        matches!(*self.state.lock(), Lifecycle::Ended { .. })
    }

    fn with_open(&self, operation: &'static str, f: impl FnOnce(&mut Span, &SpanLimits)) {
        let mut state = self.state.lock();
        match (&mut *state, &self.tracer) {
            (Lifecycle::Open(span), Some(tracer)) => f(span, &tracer.limits),
            (Lifecycle::Ended { name }, _) => Misuse::SpanEnded {
                name: name.clone(),
                operation,
            }
            .report(),
            _ => Misuse::SpanNotStarted { operation }.report(),
        }
    }

    pub fn set_attribute(&self, key: impl Into<String>, value: impl Into<AttributeValue>) {
        let (key, value) = (key.into(), value.into());
        self.with_open("set_attribute", |span, limits| {
            put_attribute(span, limits, key, value);
        });
    }

    pub fn set_attributes(&self, attributes: Attributes) {
        self.with_open("set_attributes", |span, limits| {
            for (key, value) in attributes {
                put_attribute(span, limits, key, value);
            }
        });
    }

    pub fn add_event(&self, name: impl Into<String>, attributes: Attributes) {
        let event = SpanEvent {
            time_unix_nano: now_unix_nanos(),
            name: name.into(),
            attributes,
        };
        self.with_open("add_event", |span, limits| put_event(span, limits, event));
    }

    pub fn set_status(&self, status: SpanStatus) {
        self.with_open("set_status", |span, _| span.status = status);
    }

    /// Adds an `exception` event and marks the span as failed.
    pub fn record_exception(&self, exception: &ExceptionRecord) {
        let event = SpanEvent {
            time_unix_nano: now_unix_nanos(),
            name: EXCEPTION_EVENT.to_string(),
            attributes: exception.event_attributes(),
        };
        self.with_open("record_exception", |span, limits| {
            put_event(span, limits, event);
            span.status = SpanStatus::Error(exception.message.clone());
            span.recorded_exception = Some(exception.clone());
        });
    }

    /// [`record_exception`](Self::record_exception) for any error value.
    pub fn record_error<E: std::error::Error + ?Sized>(&self, error: &E) {
        self.record_exception(&ExceptionRecord::from_error(error));
    }

    /// Ends the span and submits it for export (if sampled).
    ///
    /// Only the first call has any effect.
    pub fn end(&self) {
        let finished = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, Lifecycle::Unstarted) {
                Lifecycle::Open(span) => {
                    *state = Lifecycle::Ended {
                        name: span.name.clone(),
                    };
                    Some(span)
                }
                Lifecycle::Ended { name } => {
                    Misuse::SpanEnded {
                        name: name.clone(),
                        operation: "end",
                    }
                    .report();
                    *state = Lifecycle::Ended { name };
                    None
                }
                Lifecycle::Unstarted => {
                    Misuse::SpanNotStarted { operation: "end" }.report();
                    None
                }
            }
        };

        let (Some(mut span), Some(tracer)) = (finished, &self.tracer) else {
            return;
        };
        span.end_time_unix_nano = Some(now_unix_nanos().max(span.start_time_unix_nano));
        if !span.context.sampled {
            return;
        }
        let span = mask_span(*span, &tracer.masking);
        debug_assert_span_ended!(span);
        tracer.sink.submit(BatchItem::Span(span));
    }

    /// Makes this span (context and handle) the active one until the guard drops.
    ///
    /// Returns `None` for an unstarted handle.
    pub fn enter(&self) -> Option<ContextGuard> {
        context::enter_span(self)
    }
}

/// Scoped span: its context is active for the guard's lifetime, and the span
/// ends when the guard drops, on every exit path.
///
/// If the guard drops while unwinding and no status was set, the span is
/// marked as failed.
pub struct SpanGuard {
    handle: SpanHandle,
    _context: Option<ContextGuard>,
}

impl SpanGuard {
    pub fn new(handle: SpanHandle) -> Self {
        let context = handle.enter();
        Self {
            handle,
            _context: context,
        }
    }

    pub fn handle(&self) -> &SpanHandle {
        &self.handle
    }
}

impl Deref for SpanGuard {
    type Target = SpanHandle;

    fn deref(&self) -> &SpanHandle {
        &self.handle
    }
}

impl Drop for SpanGuard {
    fn drop(&mut self) {
        if std::thread::panicking() {
            let mut state = self.handle.state.lock();
            if let Lifecycle::Open(span) = &mut *state
                && span.status == SpanStatus::Unset
            {
                span.status = SpanStatus::Error("panicked".into());
            }
        }
        self.handle.end();
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Collects submitted records in memory.
    #[derive(Default)]
    pub struct VecSink {
        pub items: Mutex<Vec<BatchItem>>,
    }

    impl VecSink {
        pub fn spans(&self) -> Vec<Span> {
            self.items
                .lock()
                .iter()
                .filter_map(BatchItem::as_span)
                .cloned()
                .collect()
        }
    }

    impl RecordSink for VecSink {
        fn submit(&self, item: BatchItem) -> bool {
            self.items.lock().push(item);
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::VecSink;
    use super::*;
    use crate::attrs;
    use crate::masking::REDACTED;
    use crate::sampler::{AlwaysOff, AlwaysOn, ParentBased};
    use tracing_test::traced_test;

    fn tracer_with(sampler: Box<dyn Sampler>, limits: SpanLimits) -> (Tracer, Arc<VecSink>) {
        let sink = Arc::new(VecSink::default());
        let tracer = Tracer::new(
            sampler,
            limits,
            MaskingRules::sensitive_defaults(),
            Arc::clone(&sink) as Arc<dyn RecordSink>,
        );
        (tracer, sink)
    }

    fn tracer() -> (Tracer, Arc<VecSink>) {
        tracer_with(Box::new(AlwaysOn), SpanLimits::default())
    }

    #[test]
    fn test_span_is_exported_only_after_end() {
        let (tracer, sink) = tracer();
        let span = tracer.start_span("checkout");
        span.set_attribute("cart.items", 3);
        assert!(sink.spans().is_empty());

        span.end();

        let spans = sink.spans();
        assert_eq!(spans.len(), 1);
        assert!(spans[0].is_ended());
        assert_eq!(spans[0].attributes["cart.items"], AttributeValue::Int(3));
    }

    #[traced_test]
    #[test]
    fn test_double_end_exports_once() {
        let (tracer, sink) = tracer();
        let span = tracer.start_span("op");
        span.end();
        span.end();
        span.clone().end();

        assert_eq!(sink.spans().len(), 1);
        assert!(logs_contain("already ended"));
    }

    #[traced_test]
    #[test]
    fn test_mutation_after_end_is_ignored() {
        let (tracer, sink) = tracer();
        let span = tracer.start_span("op");
        span.end();
        span.set_attribute("late", true);
        span.add_event("late", Attributes::new());

        let spans = sink.spans();
        assert!(!spans[0].attributes.contains_key("late"));
        assert!(spans[0].events.is_empty());
        assert!(logs_contain("set_attribute ignored"));
    }

    #[traced_test]
    #[test]
    fn test_unstarted_handle_is_inert() {
        let span = SpanHandle::default();
        span.set_attribute("k", "v");
        span.end();
        assert!(span.context().is_none());
        assert!(span.enter().is_none());
        assert!(logs_contain("span not started"));
    }

    #[test]
    fn test_child_links_to_active_parent() {
        let (tracer, sink) = tracer();
        tracer.in_span("parent", |parent| {
            let child = tracer.start_span("child");
            let parent_cx = parent.context().unwrap();
            let child_cx = child.context().unwrap();
            assert_eq!(child_cx.trace_id, parent_cx.trace_id);
            assert_eq!(child_cx.parent_span_id, Some(parent_cx.span_id));
            child.end();
        });

        let spans = sink.spans();
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].name, "child");
        assert_eq!(spans[1].name, "parent");
        assert!(context::current().is_none());
    }

    #[test]
    fn test_root_and_explicit_parent() {
        let (tracer, _) = tracer();
        let remote = TraceContext::new_root(true);
        let _g = context::enter(TraceContext::new_root(true));

        let root = tracer.span_builder("fresh").as_root().start();
        assert!(root.context().unwrap().parent_span_id.is_none());

        let linked = tracer.span_builder("linked").with_parent(remote.clone()).start();
        assert_eq!(linked.context().unwrap().trace_id, remote.trace_id);
        assert_eq!(linked.context().unwrap().parent_span_id, Some(remote.span_id));
    }

    #[test]
    fn test_attributes_and_events_are_masked_on_end() {
        let (tracer, sink) = tracer();
        let span = tracer
            .span_builder("login")
            .with_kind(SpanKind::Server)
            .with_attributes(attrs! { "user" => "bob", "password" => "hunter2" })
            .start();
        span.add_event("auth", attrs! { "auth_token" => "abc" });
        span.end();

        let exported = &sink.spans()[0];
        assert_eq!(exported.kind, SpanKind::Server);
        assert_eq!(exported.attributes["password"].as_str(), Some(REDACTED));
        assert_eq!(exported.attributes["user"].as_str(), Some("bob"));
        assert_eq!(exported.events[0].attributes["auth_token"].as_str(), Some(REDACTED));
    }

    #[test]
    fn test_record_exception_sets_error() {
        let (tracer, sink) = tracer();
        let span = tracer.start_span("io");
        let error = std::io::Error::new(std::io::ErrorKind::NotFound, "missing file");
        span.record_error(&error);
        span.end();

        let exported = &sink.spans()[0];
        assert_eq!(exported.status, SpanStatus::Error("missing file".into()));
        let event = exported.event(EXCEPTION_EVENT).unwrap();
        assert_eq!(event.attributes["exception.type"].as_str(), Some("Error"));
        assert_eq!(
            exported.recorded_exception.as_ref().map(|e| e.message.as_str()),
            Some("missing file")
        );
    }

    #[test]
    fn test_span_limits_count_drops() {
        let limits = SpanLimits {
            max_attributes: 2,
            max_events: 1,
        };
        let (tracer, sink) = tracer_with(Box::new(AlwaysOn), limits);
        let span = tracer.start_span("limited");
        span.set_attribute("a", 1);
        span.set_attribute("b", 2);
        span.set_attribute("c", 3);
        span.set_attribute("a", 10); // overwrite is not a drop
        span.add_event("e1", Attributes::new());
        span.add_event("e2", Attributes::new());
        span.end();

        let exported = &sink.spans()[0];
        assert_eq!(exported.attributes.len(), 2);
        assert_eq!(exported.attributes["a"], AttributeValue::Int(10));
        assert_eq!(exported.dropped_attributes_count, 1);
        assert_eq!(exported.events.len(), 1);
        assert_eq!(exported.dropped_events_count, 1);
    }

    #[test]
    fn test_unsampled_spans_propagate_but_are_not_exported() {
        let (tracer, sink) = tracer_with(Box::new(ParentBased::new(AlwaysOff)), SpanLimits::default());
        tracer.in_span("root", |root| {
            assert!(!root.is_recording());
            let child = tracer.start_span("child");
            assert!(!child.context().unwrap().sampled);
            assert_eq!(child.context().unwrap().trace_id, root.context().unwrap().trace_id);
            child.end();
        });
        assert!(sink.spans().is_empty());
    }

    #[test]
    fn test_guard_ends_span_on_panic() {
        let (tracer, sink) = tracer();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            tracer.in_span("doomed", |_| panic!("boom"));
        }));
        assert!(result.is_err());

        let spans = sink.spans();
        assert_eq!(spans.len(), 1);
        assert!(spans[0].status.is_error());
        assert!(context::current().is_none());
    }

    #[test]
    fn test_handle_can_be_ended_from_another_thread() {
        let (tracer, sink) = tracer();
        let span = tracer.start_span("handoff");
        let remote = span.clone();
        std::thread::spawn(move || {
            remote.set_attribute("worker", "t1");
            remote.end();
        })
        .join()
        .unwrap();

        assert!(span.is_ended());
        assert_eq!(sink.spans()[0].attributes["worker"].as_str(), Some("t1"));
    }

    fn tag_active_span(depth: i64) {
        if let Some(span) = current_span() {
            span.set_attribute("depth", depth);
        }
    }

    #[test]
    fn test_current_span_tracks_entered_handles() {
        let (tracer, sink) = tracer();
        assert!(current_span().is_none());

        tracer.in_span("outer", |outer| {
            assert_eq!(current_span().unwrap().context(), outer.context());
            {
                let inner = tracer.start_span("inner");
                let _entered = inner.enter();
                assert_eq!(current_span().unwrap().context(), inner.context());
                tag_active_span(2);
                inner.end();
            }
            assert_eq!(current_span().unwrap().context(), outer.context());
            tag_active_span(1);
        });
        assert!(current_span().is_none());

        let spans = sink.spans();
        assert_eq!(spans[0].name, "inner");
        assert_eq!(spans[0].attributes["depth"], AttributeValue::Int(2));
        assert_eq!(spans[1].attributes["depth"], AttributeValue::Int(1));
    }

    #[test]
    fn test_bare_context_has_no_current_span() {
        let _g = context::enter(TraceContext::new_root(true));
        assert!(context::current().is_some());
        assert!(current_span().is_none());
    }

    #[traced_test]
    #[test]
    fn test_current_span_helper_without_span_reports_misuse() {
        let mut called = false;
        with_current_span("add_event", |_| called = true);
        assert!(!called);
        assert!(logs_contain("no active span"));
    }

    #[tokio::test]
    async fn test_current_span_crosses_await_points() {
        use crate::context::FutureExt;

        let (tracer, sink) = tracer();
        let span = tracer.start_span("async-op");
        async {
            tokio::task::yield_now().await;
            if let Some(active) = current_span() {
                active.add_event("resumed", Attributes::new());
            }
        }
        .with_span(&span)
        .await;
        assert!(current_span().is_none());

        let seen = {
            let _entered = span.enter();
            context::spawn(async { current_span().and_then(|s| s.context().map(|cx| cx.span_id)) })
        }
        .await
        .unwrap();
        assert_eq!(seen, span.context().map(|cx| cx.span_id));

        span.end();
        assert_eq!(sink.spans()[0].events[0].name, "resumed");
    }
}
