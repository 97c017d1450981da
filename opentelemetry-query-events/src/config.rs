//! Handler configuration
//!
//! A [`HandlerConfig`] is captured when a handler is attached and stays
//! immutable for every notification the handler receives afterwards.
use crate::error::QueryEventError;
use opentelemetry::{otel_warn, KeyValue};
use std::borrow::Cow;
use std::env;
use std::fmt;
use std::str::FromStr;

/// Environment variable selecting the default [`TimeUnit`].
pub const OTEL_QUERY_EVENTS_TIME_UNIT: &str = "OTEL_QUERY_EVENTS_TIME_UNIT";

/// Environment variable selecting the default span name prefix.
pub const OTEL_QUERY_EVENTS_SPAN_PREFIX: &str = "OTEL_QUERY_EVENTS_SPAN_PREFIX";

/// Unit used for the `*_time_*` span attributes.
///
/// Timings arrive in native ticks, one tick being one microsecond.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum TimeUnit {
    /// Raw native ticks, emitted without a key suffix.
    Native,
    /// Microseconds.
    #[default]
    Microsecond,
    /// Milliseconds.
    Millisecond,
    /// Seconds.
    Second,
}

impl TimeUnit {
    /// Number of native ticks in one unit.
    pub fn ticks_per_unit(self) -> u64 {
        match self {
            TimeUnit::Native | TimeUnit::Microsecond => 1,
            TimeUnit::Millisecond => 1_000,
            TimeUnit::Second => 1_000_000,
        }
    }

    /// Suffix appended to timing attribute keys, `None` for native ticks.
    pub fn key_suffix(self) -> Option<&'static str> {
        match self {
            TimeUnit::Native => None,
            TimeUnit::Microsecond => Some("microseconds"),
            TimeUnit::Millisecond => Some("milliseconds"),
            TimeUnit::Second => Some("seconds"),
        }
    }
}

impl FromStr for TimeUnit {
    type Err = QueryEventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "native" => Ok(TimeUnit::Native),
            "microsecond" | "microseconds" => Ok(TimeUnit::Microsecond),
            "millisecond" | "milliseconds" => Ok(TimeUnit::Millisecond),
            "second" | "seconds" => Ok(TimeUnit::Second),
            _ => Err(QueryEventError::UnsupportedTimeUnit(s.to_string())),
        }
    }
}

impl fmt::Display for TimeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TimeUnit::Native => "native",
            TimeUnit::Microsecond => "microsecond",
            TimeUnit::Millisecond => "millisecond",
            TimeUnit::Second => "second",
        })
    }
}

/// Configuration bound to a query span handler.
///
/// # Examples
///
/// ```
/// use opentelemetry_query_events::{HandlerConfig, TimeUnit};
///
/// let config = HandlerConfig::default()
///     .with_time_unit(TimeUnit::Millisecond)
///     .with_span_prefix("Custom");
///
/// assert_eq!(config.time_unit(), TimeUnit::Millisecond);
/// assert_eq!(config.span_prefix(), Some("Custom"));
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct HandlerConfig {
    time_unit: TimeUnit,
    span_prefix: Option<Cow<'static, str>>,
    additional_attributes: Vec<KeyValue>,
}

impl Default for HandlerConfig {
    /// Microsecond timings and a prefix derived from the data source name,
    /// unless overridden by `OTEL_QUERY_EVENTS_TIME_UNIT` or
    /// `OTEL_QUERY_EVENTS_SPAN_PREFIX`.
    fn default() -> Self {
        let mut config = HandlerConfig {
            time_unit: TimeUnit::default(),
            span_prefix: None,
            additional_attributes: Vec::new(),
        };

        if let Ok(unit) = env::var(OTEL_QUERY_EVENTS_TIME_UNIT) {
            match unit.parse::<TimeUnit>() {
                Ok(time_unit) => config.time_unit = time_unit,
                Err(_) => {
                    otel_warn!(
                        name: "QueryEvents.Config.InvalidTimeUnit",
                        message = format!(
                            "Unrecognized time unit '{}' in OTEL_QUERY_EVENTS_TIME_UNIT. Valid values are: native, microsecond, millisecond, second. Using fallback: microsecond",
                            unit
                        )
                    );
                }
            }
        }

        if let Some(prefix) = env::var(OTEL_QUERY_EVENTS_SPAN_PREFIX)
            .ok()
            .filter(|prefix| !prefix.is_empty())
        {
            config.span_prefix = Some(Cow::Owned(prefix));
        }

        config
    }
}

impl HandlerConfig {
    /// Sets the unit for timing attributes.
    pub fn with_time_unit(mut self, time_unit: TimeUnit) -> Self {
        self.time_unit = time_unit;
        self
    }

    /// Sets the span name prefix. Without one, the data source name is used.
    pub fn with_span_prefix(mut self, prefix: impl Into<Cow<'static, str>>) -> Self {
        self.span_prefix = Some(prefix.into());
        self
    }

    /// Attributes added to every span, after the ones computed from the event.
    pub fn with_additional_attributes<I>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = KeyValue>,
    {
        self.additional_attributes.extend(attributes);
        self
    }

    /// The configured time unit.
    pub fn time_unit(&self) -> TimeUnit {
        self.time_unit
    }

    /// The explicit span prefix, if one was configured.
    pub fn span_prefix(&self) -> Option<&str> {
        self.span_prefix.as_deref()
    }

    /// Static attributes appended to every span.
    pub fn additional_attributes(&self) -> &[KeyValue] {
        &self.additional_attributes
    }

    pub(crate) fn resolved_prefix(&self, source_name: &str) -> String {
        self.span_prefix
            .as_deref()
            .unwrap_or(source_name)
            .to_string()
    }
}
