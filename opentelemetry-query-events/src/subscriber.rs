//! Process-wide subscriptions to query event channels.
//!
//! A query layer publishes each notification with [`dispatch`] on the channel
//! of its data source (see [`channel_id`]). Applications subscribe with
//! [`attach`] and unsubscribe with [`detach`].
//!
//! A channel holds at most one handler. [`dispatch`] looks the handler up
//! under a read lock and invokes it after releasing the lock, so a handler is
//! never invoked by a dispatch that begins after [`detach`] returned.
//! Dispatches already in flight when [`detach`] runs complete normally. A
//! query started before [`detach`] is ended by its stop marker even though
//! no handler receives it.
use crate::config::HandlerConfig;
use crate::error::{QueryEventError, QueryEventResult};
use crate::event::{Marker, QueryEvent};
use crate::handler::{release_orphaned, QuerySpanHandler};
use opentelemetry::trace::Tracer;
use opentelemetry::{global, otel_debug, otel_error, otel_warn, InstrumentationScope};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock};

/// Suffix appended to a data source name to form its channel identifier.
pub const QUERY_CHANNEL_SUFFIX: &str = ":query";

const INSTRUMENTATION_SCOPE_NAME: &str = "opentelemetry-query-events";

/// Receives the notifications published on a channel.
///
/// Implementations are called concurrently from any thread that runs queries
/// and must not block.
pub trait QueryEventHandler: Send + Sync {
    /// Handles one notification.
    ///
    /// An error only affects this notification; it is logged by [`dispatch`].
    fn handle(&self, channel: &str, marker: Marker, event: &QueryEvent) -> QueryEventResult<()>;
}

/// Identifier of a registered handler, returned by [`attach`].
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    id: u64,
    channel: String,
}

impl SubscriptionHandle {
    /// Channel the handler is registered on.
    pub fn channel(&self) -> &str {
        &self.channel
    }
}

struct Registration {
    id: u64,
    handler: Arc<dyn QueryEventHandler>,
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration").field("id", &self.id).finish()
    }
}

type Registry = HashMap<String, Registration>;

static REGISTRY: OnceLock<RwLock<Registry>> = OnceLock::new();
static NEXT_SUBSCRIPTION_ID: AtomicU64 = AtomicU64::new(1);

#[inline]
fn registry() -> &'static RwLock<Registry> {
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Channel identifier of the data source `source_name`.
///
/// ```
/// assert_eq!(opentelemetry_query_events::channel_id("blog.repo"), "blog.repo:query");
/// ```
pub fn channel_id(source_name: &str) -> String {
    format!("{source_name}{QUERY_CHANNEL_SUFFIX}")
}

/// Registers `handler` on `channel`.
pub fn attach_handler<H>(
    channel: impl Into<String>,
    handler: H,
) -> QueryEventResult<SubscriptionHandle>
where
    H: QueryEventHandler + 'static,
{
    let channel = channel.into();
    let mut registry = registry().write().map_err(|err| {
        otel_error!(
            name: "QueryEvents.Subscriber.AttachFailed",
            channel = channel.clone(),
            error = format!("{err}")
        );
        QueryEventError::from(err)
    })?;

    if registry.contains_key(&channel) {
        return Err(QueryEventError::AlreadyAttached(channel));
    }

    let id = NEXT_SUBSCRIPTION_ID.fetch_add(1, Ordering::Relaxed);
    registry.insert(
        channel.clone(),
        Registration {
            id,
            handler: Arc::new(handler),
        },
    );
    otel_debug!(name: "QueryEvents.Subscriber.Attached", channel = channel.clone());

    Ok(SubscriptionHandle { id, channel })
}

/// Creates spans for every query of `source_name`, using the global tracer
/// provider.
///
/// # Examples
///
/// ```
/// use opentelemetry_query_events::{attach, detach, HandlerConfig, TimeUnit};
///
/// let handle = attach(
///     "docs.repo",
///     HandlerConfig::default().with_time_unit(TimeUnit::Millisecond),
/// )
/// .unwrap();
///
/// detach(&handle).unwrap();
/// ```
pub fn attach(source_name: &str, config: HandlerConfig) -> QueryEventResult<SubscriptionHandle> {
    let scope = InstrumentationScope::builder(INSTRUMENTATION_SCOPE_NAME)
        .with_version(env!("CARGO_PKG_VERSION"))
        .build();
    attach_with_tracer(source_name, config, global::tracer_with_scope(scope))
}

/// Creates spans for every query of `source_name` with `tracer`.
pub fn attach_with_tracer<T>(
    source_name: &str,
    config: HandlerConfig,
    tracer: T,
) -> QueryEventResult<SubscriptionHandle>
where
    T: Tracer + Send + Sync + 'static,
    T::Span: Send + Sync + 'static,
{
    attach_handler(
        channel_id(source_name),
        QuerySpanHandler::new(tracer, source_name, config),
    )
}

/// Unregisters the handler behind `handle`.
///
/// Returns [`QueryEventError::NotAttached`] if it was already detached.
pub fn detach(handle: &SubscriptionHandle) -> QueryEventResult<()> {
    let mut registry = registry().write()?;

    let attached = registry
        .get(&handle.channel)
        .is_some_and(|registration| registration.id == handle.id);
    if !attached {
        return Err(QueryEventError::NotAttached(handle.channel.clone()));
    }

    registry.remove(&handle.channel);
    otel_debug!(
        name: "QueryEvents.Subscriber.Detached",
        channel = handle.channel.clone()
    );
    Ok(())
}

/// Whether the handler behind `handle` is still registered.
pub fn is_attached(handle: &SubscriptionHandle) -> bool {
    registry()
        .read()
        .map(|registry| {
            registry
                .get(&handle.channel)
                .is_some_and(|registration| registration.id == handle.id)
        })
        .unwrap_or(false)
}

/// Delivers a notification to the handler registered on `channel`, if any.
///
/// Handler errors are logged and do not reach the caller. A stop marker on a
/// channel without a handler still ends a query this thread opened on that
/// channel before its handler was detached, so the thread's context is
/// restored.
pub fn dispatch(channel: &str, marker: Marker, event: &QueryEvent) {
    let handler = match registry().read() {
        Ok(registry) => registry
            .get(channel)
            .map(|registration| registration.handler.clone()),
        Err(err) => {
            otel_error!(
                name: "QueryEvents.Subscriber.DispatchFailed",
                channel = channel.to_string(),
                error = format!("{err}")
            );
            None
        }
    };

    match handler {
        Some(handler) => {
            if let Err(err) = handler.handle(channel, marker, event) {
                otel_warn!(
                    name: "QueryEvents.Subscriber.EventDropped",
                    channel = channel.to_string(),
                    error = format!("{err}")
                );
            }
        }
        None if !matches!(marker, Marker::Start(_)) => {
            if release_orphaned(channel, marker, event) {
                otel_debug!(
                    name: "QueryEvents.Subscriber.OrphanReleased",
                    channel = channel.to_string(),
                    message = "Query outlived its detached handler, span ended without attributes."
                );
            }
        }
        None => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::timing;
    use std::sync::Mutex;
    use std::time::SystemTime;

    #[derive(Clone, Default)]
    struct Recording(Arc<Mutex<Vec<(String, Marker)>>>);

    impl QueryEventHandler for Recording {
        fn handle(
            &self,
            channel: &str,
            marker: Marker,
            _event: &QueryEvent,
        ) -> QueryEventResult<()> {
            self.0.lock().unwrap().push((channel.to_string(), marker));
            Ok(())
        }
    }

    struct Failing;

    impl QueryEventHandler for Failing {
        fn handle(
            &self,
            _channel: &str,
            _marker: Marker,
            event: &QueryEvent,
        ) -> QueryEventResult<()> {
            Err(QueryEventError::MissingStatement(event.source_name().to_string()))
        }
    }

    fn event() -> QueryEvent {
        QueryEvent::new("subscriber.repo")
            .with_statement("SELECT 1")
            .with_timing(timing::TOTAL, 1)
    }

    #[test]
    fn dispatch_reaches_attached_handler_only() {
        let recording = Recording::default();
        let handle = attach_handler("subscriber.one:query", recording.clone()).unwrap();
        let start = Marker::Start(SystemTime::now());

        dispatch("subscriber.one:query", start, &event());
        dispatch("subscriber.other:query", start, &event());

        assert_eq!(
            *recording.0.lock().unwrap(),
            vec![("subscriber.one:query".to_string(), start)]
        );
        detach(&handle).unwrap();
    }

    #[test]
    fn no_delivery_after_detach() {
        let recording = Recording::default();
        let handle = attach_handler("subscriber.two:query", recording.clone()).unwrap();

        assert!(is_attached(&handle));
        detach(&handle).unwrap();
        assert!(!is_attached(&handle));
        dispatch("subscriber.two:query", Marker::Stop(SystemTime::now()), &event());

        assert!(recording.0.lock().unwrap().is_empty());
    }

    #[test]
    fn second_detach_is_reported() {
        let handle = attach_handler("subscriber.three:query", Recording::default()).unwrap();

        assert_eq!(detach(&handle), Ok(()));
        assert_eq!(
            detach(&handle),
            Err(QueryEventError::NotAttached("subscriber.three:query".into()))
        );
    }

    #[test]
    fn one_handler_per_channel() {
        let handle = attach_handler("subscriber.four:query", Recording::default()).unwrap();

        assert_eq!(
            attach_handler("subscriber.four:query", Recording::default()).unwrap_err(),
            QueryEventError::AlreadyAttached("subscriber.four:query".into())
        );

        detach(&handle).unwrap();
        let again = attach_handler("subscriber.four:query", Recording::default()).unwrap();
        assert_eq!(
            detach(&handle),
            Err(QueryEventError::NotAttached("subscriber.four:query".into()))
        );
        assert!(is_attached(&again));
        detach(&again).unwrap();
    }

    #[test]
    fn handler_errors_are_contained() {
        let handle = attach_handler("subscriber.five:query", Failing).unwrap();

        dispatch("subscriber.five:query", Marker::Stop(SystemTime::now()), &event());

        assert!(is_attached(&handle));
        detach(&handle).unwrap();
    }
}
