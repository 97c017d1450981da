//! Query event notifications emitted by a database access layer.
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::fmt;
use std::time::{Duration, SystemTime};

/// Well-known timing categories.
pub mod timing {
    /// Time spent waiting to check a connection out of the pool.
    pub const QUEUE: &str = "queue";
    /// Time spent executing the query.
    pub const QUERY: &str = "query";
    /// Time spent decoding the result.
    pub const DECODE: &str = "decode";
    /// Time the connection sat idle in the pool before checkout.
    pub const IDLE: &str = "idle";
    /// Sum of the other categories.
    pub const TOTAL: &str = "total";
}

/// Position of a notification in the life of a query execution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Marker {
    /// The query was issued.
    Start(SystemTime),
    /// The query returned, successfully or with a database error.
    Stop(SystemTime),
    /// The query raised before returning a result.
    Exception(SystemTime),
}

impl Marker {
    /// Timestamp carried by the marker.
    pub fn time(&self) -> SystemTime {
        match *self {
            Marker::Start(time) | Marker::Stop(time) | Marker::Exception(time) => time,
        }
    }
}

/// Result of a query execution.
#[derive(Default)]
pub enum Outcome {
    /// The query succeeded. Result details are not recorded.
    #[default]
    Success,
    /// The query failed with the given error.
    Failure(Box<dyn StdError + Send + Sync + 'static>),
}

impl Outcome {
    /// Builds a failure from any error value.
    pub fn failure<E>(err: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        Outcome::Failure(err.into())
    }

    /// Human readable message of a failure.
    pub fn error_message(&self) -> Option<String> {
        match self {
            Outcome::Success => None,
            Outcome::Failure(err) => Some(err.to_string()),
        }
    }
}

impl fmt::Debug for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success => f.write_str("Success"),
            Outcome::Failure(err) => f.debug_tuple("Failure").field(&err.to_string()).finish(),
        }
    }
}

/// Transport and connection details of the connection that ran a query.
///
/// Every field is optional; drivers and pools report different subsets.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub(crate) system: Option<String>,
    pub(crate) database: Option<String>,
    pub(crate) user: Option<String>,
    pub(crate) connection_string: Option<String>,
    pub(crate) host: Option<String>,
    pub(crate) port: Option<u16>,
    pub(crate) transport: Option<String>,
}

impl ConnectionInfo {
    /// Database management system, e.g. `postgresql`.
    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    /// Name of the database being accessed.
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// User the connection authenticated as.
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Connection string or URL used by the pool.
    pub fn with_connection_string(mut self, connection_string: impl Into<String>) -> Self {
        self.connection_string = Some(connection_string.into());
        self
    }

    /// Host name of the database server.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Port of the database server.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Transport kind, e.g. `ip_tcp` or `unix`.
    pub fn with_transport(mut self, transport: impl Into<String>) -> Self {
        self.transport = Some(transport.into());
        self
    }
}

/// A single query execution notification.
///
/// Built by the query layer when it notifies subscribers and read-only from
/// then on.
///
/// # Examples
///
/// ```
/// use opentelemetry_query_events::{event::timing, QueryEvent};
///
/// let event = QueryEvent::new("blog.repo")
///     .with_query_source("users")
///     .with_statement("SELECT u.id FROM users AS u")
///     .with_timing(timing::QUERY, 120)
///     .with_timing(timing::TOTAL, 128);
///
/// assert_eq!(event.timing(timing::QUERY), Some(120));
/// ```
#[derive(Debug, Default)]
pub struct QueryEvent {
    source_name: String,
    query_source: Option<String>,
    statement: Option<String>,
    timings: BTreeMap<Cow<'static, str>, u64>,
    connection_info: Option<ConnectionInfo>,
    outcome: Outcome,
}

impl QueryEvent {
    /// Creates an event emitted by the data source `source_name`.
    pub fn new(source_name: impl Into<String>) -> Self {
        QueryEvent {
            source_name: source_name.into(),
            ..Default::default()
        }
    }

    /// Sets the table or collection the query reads from.
    pub fn with_query_source(mut self, query_source: impl Into<String>) -> Self {
        self.query_source = Some(query_source.into());
        self
    }

    /// Sets the executed query text.
    pub fn with_statement(mut self, statement: impl Into<String>) -> Self {
        self.statement = Some(statement.into());
        self
    }

    /// Records `ticks` native ticks for the timing `category`, replacing any
    /// earlier value for it.
    pub fn with_timing(mut self, category: impl Into<Cow<'static, str>>, ticks: u64) -> Self {
        self.timings.insert(category.into(), ticks);
        self
    }

    /// Records a timing from a [`Duration`], truncated to whole native ticks.
    pub fn with_timing_duration(
        self,
        category: impl Into<Cow<'static, str>>,
        duration: Duration,
    ) -> Self {
        let ticks = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        self.with_timing(category, ticks)
    }

    /// Sets the connection metadata.
    pub fn with_connection_info(mut self, connection_info: ConnectionInfo) -> Self {
        self.connection_info = Some(connection_info);
        self
    }

    /// Sets the outcome of the query.
    pub fn with_outcome(mut self, outcome: Outcome) -> Self {
        self.outcome = outcome;
        self
    }

    /// Name of the data source that emitted the event.
    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    /// Table or collection the query reads from.
    pub fn query_source(&self) -> Option<&str> {
        self.query_source.as_deref()
    }

    /// The executed query text.
    pub fn statement(&self) -> Option<&str> {
        self.statement.as_deref()
    }

    /// Native ticks reported for `category`.
    pub fn timing(&self, category: &str) -> Option<u64> {
        self.timings.get(category).copied()
    }

    /// All reported timings, ordered by category name.
    pub fn timings(&self) -> impl Iterator<Item = (&str, u64)> {
        self.timings
            .iter()
            .map(|(category, ticks)| (category.as_ref(), *ticks))
    }

    /// Connection metadata, when the driver reported any.
    pub fn connection_info(&self) -> Option<&ConnectionInfo> {
        self.connection_info.as_ref()
    }

    /// Result of the query.
    pub fn outcome(&self) -> &Outcome {
        &self.outcome
    }
}
