//! Span correlation for query notifications.
//!
//! A start marker opens a client span as a child of the span active in the
//! calling thread's [`Context`], then attaches the new span as the active
//! context. The matching stop or exception marker ends the span and drops the
//! [`ContextGuard`], restoring the previous context.
//!
//! Active queries live on a thread-local stack, so parallel queries issued
//! from different threads never see each other's spans, while queries issued
//! synchronously inside another query's execution nest under it.
use crate::attributes::map_attributes;
use crate::config::HandlerConfig;
use crate::error::QueryEventResult;
use crate::event::{Marker, QueryEvent};
use crate::subscriber::QueryEventHandler;
use opentelemetry::trace::{SpanKind, Status, TraceContextExt, Tracer};
use opentelemetry::{otel_debug, Context, ContextGuard};
use std::cell::RefCell;
use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

/// Span name suffix used when the event has no query source.
pub const DEFAULT_QUERY_SOURCE: &str = "query";

/// Status description for an exception marker whose event carries no error.
const RAISED_WITHOUT_ERROR: &str = "query raised before completing";

static NEXT_HANDLER_KEY: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static ACTIVE_QUERIES: RefCell<ActiveQueries> =
        const { RefCell::new(ActiveQueries(Vec::new())) };
}

struct ActiveQuery {
    handler_key: u64,
    channel: String,
    cx: Context,
    // Restores the parent context when dropped.
    _guard: ContextGuard,
}

struct ActiveQueries(Vec<ActiveQuery>);

impl Drop for ActiveQueries {
    // Queries still open when the thread exits are leaked. Dropping their
    // guards or spans here would reach the context storage of a thread that
    // is being torn down.
    fn drop(&mut self) {
        mem::forget(mem::take(&mut self.0));
    }
}

/// Removes the most recent active query on this thread matching `pred`.
fn take_active(pred: impl FnMut(&ActiveQuery) -> bool) -> Option<ActiveQuery> {
    ACTIVE_QUERIES
        .try_with(|active| {
            let mut active = active.borrow_mut();
            let pos = active.0.iter().rposition(pred)?;
            Some(active.0.remove(pos))
        })
        .ok()
        .flatten()
}

/// Number of queries currently open on this thread, across all handlers.
pub fn active_query_depth() -> usize {
    ACTIVE_QUERIES.with(|active| active.borrow().0.len())
}

/// Status description of a stop or exception marker, `None` on success.
fn failure_message(marker: Marker, event: &QueryEvent) -> Option<String> {
    match marker {
        Marker::Start(_) => None,
        Marker::Stop(_) => event.outcome().error_message(),
        Marker::Exception(_) => Some(
            event
                .outcome()
                .error_message()
                .unwrap_or_else(|| RAISED_WITHOUT_ERROR.to_string()),
        ),
    }
}

/// Ends the most recent query opened on this thread for `channel` and
/// restores the context it replaced.
///
/// Used for stop markers that arrive after the handler of `channel` was
/// detached. The span gets no attributes. Returns `false` if this thread had
/// no open query on `channel`.
pub(crate) fn release_orphaned(channel: &str, marker: Marker, event: &QueryEvent) -> bool {
    let Some(orphan) = take_active(|query| query.channel == channel) else {
        return false;
    };

    let span = orphan.cx.span();
    if let Some(message) = failure_message(marker, event) {
        span.set_status(Status::error(message));
    }
    span.end_with_timestamp(marker.time());
    true
}

/// Turns query notifications into client spans.
pub struct QuerySpanHandler<T> {
    key: u64,
    tracer: T,
    span_prefix: String,
    config: HandlerConfig,
}

impl<T> fmt::Debug for QuerySpanHandler<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuerySpanHandler")
            .field("span_prefix", &self.span_prefix)
            .field("config", &self.config)
            .finish()
    }
}

impl<T> QuerySpanHandler<T>
where
    T: Tracer,
    T::Span: Send + Sync + 'static,
{
    /// Creates a handler for events emitted by `source_name`.
    pub fn new(tracer: T, source_name: &str, config: HandlerConfig) -> Self {
        QuerySpanHandler {
            key: NEXT_HANDLER_KEY.fetch_add(1, Ordering::Relaxed),
            tracer,
            span_prefix: config.resolved_prefix(source_name),
            config,
        }
    }

    /// Name of the span for a query reading from `query_source`.
    pub fn span_name(&self, query_source: Option<&str>) -> String {
        format!(
            "{}:{}",
            self.span_prefix,
            query_source.unwrap_or(DEFAULT_QUERY_SOURCE)
        )
    }

    fn start(&self, channel: &str, time: SystemTime, event: &QueryEvent) {
        let parent = Context::current();
        let builder = self
            .tracer
            .span_builder(self.span_name(event.query_source()))
            .with_kind(SpanKind::Client)
            .with_start_time(time);
        let span = self.tracer.build_with_context(builder, &parent);
        let cx = parent.with_span(span);
        let guard = cx.clone().attach();

        ACTIVE_QUERIES.with(|active| {
            active.borrow_mut().0.push(ActiveQuery {
                handler_key: self.key,
                channel: channel.to_string(),
                cx,
                _guard: guard,
            })
        });
    }

    fn finish(
        &self,
        time: SystemTime,
        event: &QueryEvent,
        failure: Option<String>,
    ) -> QueryEventResult<()> {
        let Some(active) = take_active(|query| query.handler_key == self.key) else {
            otel_debug!(
                name: "QueryEvents.Handler.UnmatchedStop",
                source_name = event.source_name().to_string(),
                message = "Stop marker without a matching start on this thread was dropped."
            );
            return Ok(());
        };

        let span = active.cx.span();
        let result = map_attributes(event, &self.config)
            .map(|attributes| span.set_attributes(attributes));
        if let Some(message) = failure {
            span.set_status(Status::error(message));
        }
        span.end_with_timestamp(time);

        result
    }
}

impl<T> QueryEventHandler for QuerySpanHandler<T>
where
    T: Tracer + Send + Sync,
    T::Span: Send + Sync + 'static,
{
    fn handle(&self, channel: &str, marker: Marker, event: &QueryEvent) -> QueryEventResult<()> {
        let time = marker.time();
        match marker {
            Marker::Start(_) => {
                self.start(channel, time, event);
                Ok(())
            }
            Marker::Stop(_) | Marker::Exception(_) => {
                self.finish(time, event, failure_message(marker, event))
            }
        }
    }
}
