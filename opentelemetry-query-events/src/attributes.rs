//! Span attributes computed from a [`QueryEvent`].
//!
//! Keys only appear when the event carries the data behind them; nothing is
//! emitted with a placeholder value.
use crate::config::{HandlerConfig, TimeUnit};
use crate::error::{QueryEventError, QueryEventResult};
use crate::event::QueryEvent;
use opentelemetry::{Key, KeyValue, Value};

/// Kind of database the span describes. Always [`DB_TYPE_SQL`].
pub const DB_TYPE: &str = "db.type";
/// Value of [`DB_TYPE`] for relational query layers.
pub const DB_TYPE_SQL: &str = "sql";
/// The executed query text.
pub const DB_STATEMENT: &str = "db.statement";
/// Table or collection the query reads from.
pub const DB_SQL_TABLE: &str = "db.sql.table";
/// Database management system.
pub const DB_SYSTEM: &str = "db.system";
/// Database name.
pub const DB_NAME: &str = "db.name";
/// Database instance, reported with the same value as [`DB_NAME`].
pub const DB_INSTANCE: &str = "db.instance";
/// Database user.
pub const DB_USER: &str = "db.user";
/// Connection string used to reach the database.
pub const DB_CONNECTION_STRING: &str = "db.connection_string";
/// Host name of the database server.
pub const NET_PEER_NAME: &str = "net.peer.name";
/// Port of the database server.
pub const NET_PEER_PORT: &str = "net.peer.port";
/// Transport used to reach the database server.
pub const NET_TRANSPORT: &str = "net.transport";

/// A flat, variable-shape set of span attributes.
///
/// Each key appears at most once.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AttributeSet {
    attributes: Vec<KeyValue>,
}

impl AttributeSet {
    /// Value stored under `key`.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.attributes
            .iter()
            .find(|kv| kv.key.as_str() == key)
            .map(|kv| &kv.value)
    }

    /// Whether `key` is present.
    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Number of attributes.
    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    /// Whether the set holds no attributes.
    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    /// Iterates over the attributes in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &KeyValue> {
        self.attributes.iter()
    }

    fn insert(&mut self, key: impl Into<Key>, value: impl Into<Value>) {
        let key = key.into();
        if !self.contains_key(key.as_str()) {
            self.attributes.push(KeyValue::new(key, value));
        }
    }

    fn insert_opt<V: Into<Value>>(&mut self, key: &'static str, value: Option<V>) {
        if let Some(value) = value {
            self.insert(key, value);
        }
    }
}

impl IntoIterator for AttributeSet {
    type Item = KeyValue;
    type IntoIter = std::vec::IntoIter<KeyValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.attributes.into_iter()
    }
}

/// Attribute key for the timing `category` in `unit`.
///
/// ```
/// use opentelemetry_query_events::{attributes::timing_key, TimeUnit};
///
/// assert_eq!(timing_key("query", TimeUnit::Millisecond), "query_time_milliseconds");
/// assert_eq!(timing_key("query", TimeUnit::Native), "query_time");
/// ```
pub fn timing_key(category: &str, unit: TimeUnit) -> String {
    match unit.key_suffix() {
        Some(suffix) => format!("{category}_time_{suffix}"),
        None => format!("{category}_time"),
    }
}

/// Converts native ticks into `unit`.
///
/// Native and microsecond values stay exact integers. Millisecond and second
/// values are floats divided once, so sub-unit precision is kept.
pub fn convert_ticks(ticks: u64, unit: TimeUnit) -> Value {
    match unit {
        TimeUnit::Native | TimeUnit::Microsecond => {
            Value::I64(i64::try_from(ticks).unwrap_or(i64::MAX))
        }
        TimeUnit::Millisecond | TimeUnit::Second => {
            Value::F64(ticks as f64 / unit.ticks_per_unit() as f64)
        }
    }
}

/// Maps a query event to span attributes.
///
/// Fails only when the event has no statement.
pub fn map_attributes(
    event: &QueryEvent,
    config: &HandlerConfig,
) -> QueryEventResult<AttributeSet> {
    let statement = event
        .statement()
        .ok_or_else(|| QueryEventError::MissingStatement(event.source_name().to_string()))?;

    let mut attributes = AttributeSet::default();
    attributes.insert(DB_TYPE, DB_TYPE_SQL);
    attributes.insert(DB_STATEMENT, statement.to_string());
    attributes.insert_opt(DB_SQL_TABLE, event.query_source().map(str::to_string));

    if let Some(info) = event.connection_info() {
        attributes.insert_opt(DB_SYSTEM, info.system.clone());
        attributes.insert_opt(DB_NAME, info.database.clone());
        attributes.insert_opt(DB_INSTANCE, info.database.clone());
        attributes.insert_opt(DB_USER, info.user.clone());
        attributes.insert_opt(DB_CONNECTION_STRING, info.connection_string.clone());
        attributes.insert_opt(NET_PEER_NAME, info.host.clone());
        attributes.insert_opt(NET_PEER_PORT, info.port.map(i64::from));
        attributes.insert_opt(NET_TRANSPORT, info.transport.clone());
    }

    let unit = config.time_unit();
    for (category, ticks) in event.timings() {
        attributes.insert(timing_key(category, unit), convert_ticks(ticks, unit));
    }

    for kv in config.additional_attributes() {
        attributes.insert(kv.key.clone(), kv.value.clone());
    }

    Ok(attributes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{timing, ConnectionInfo, Outcome};
    use rstest::rstest;

    fn users_event() -> QueryEvent {
        QueryEvent::new("blog.repo")
            .with_query_source("users")
            .with_statement("SELECT u0.\"id\", u0.\"email\" FROM \"users\" AS u0")
            .with_timing(timing::QUERY, 120)
            .with_timing(timing::DECODE, 5)
            .with_timing(timing::QUEUE, 3)
            .with_timing(timing::TOTAL, 128)
    }

    fn config(unit: TimeUnit) -> HandlerConfig {
        HandlerConfig::default().with_time_unit(unit)
    }

    #[test]
    fn microsecond_timings_pass_through() {
        let attributes = map_attributes(&users_event(), &config(TimeUnit::Microsecond)).unwrap();

        assert_eq!(attributes.get(DB_TYPE), Some(&Value::from("sql")));
        assert_eq!(
            attributes.get(DB_STATEMENT),
            Some(&Value::from(
                "SELECT u0.\"id\", u0.\"email\" FROM \"users\" AS u0".to_string()
            ))
        );
        assert_eq!(attributes.get(DB_SQL_TABLE), Some(&Value::from("users".to_string())));
        assert_eq!(attributes.get("query_time_microseconds"), Some(&Value::I64(120)));
        assert_eq!(attributes.get("decode_time_microseconds"), Some(&Value::I64(5)));
        assert_eq!(attributes.get("queue_time_microseconds"), Some(&Value::I64(3)));
        assert_eq!(attributes.get("total_time_microseconds"), Some(&Value::I64(128)));
        assert_eq!(attributes.len(), 7);
    }

    #[test]
    fn millisecond_timings_are_divided() {
        let attributes = map_attributes(&users_event(), &config(TimeUnit::Millisecond)).unwrap();

        assert_eq!(attributes.get("query_time_milliseconds"), Some(&Value::F64(0.12)));
        assert_eq!(attributes.get("decode_time_milliseconds"), Some(&Value::F64(0.005)));
        assert_eq!(attributes.get("queue_time_milliseconds"), Some(&Value::F64(0.003)));
        assert_eq!(attributes.get("total_time_milliseconds"), Some(&Value::F64(0.128)));
        assert!(!attributes.contains_key("query_time_microseconds"));
    }

    #[rstest]
    #[case(TimeUnit::Microsecond)]
    #[case(TimeUnit::Millisecond)]
    #[case(TimeUnit::Second)]
    fn conversion_is_linear_for_every_category(#[case] unit: TimeUnit) {
        let event = users_event();
        let attributes = map_attributes(&event, &config(unit)).unwrap();
        let factor = unit.ticks_per_unit() as f64;

        for (category, ticks) in event.timings() {
            let value = attributes.get(&timing_key(category, unit)).unwrap();
            let converted = match value {
                Value::I64(v) => *v as f64,
                Value::F64(v) => *v,
                other => panic!("unexpected timing value {other:?}"),
            };
            assert_eq!(converted, ticks as f64 / factor);
        }
    }

    #[test]
    fn native_timings_have_no_suffix() {
        let event = users_event().with_timing(timing::IDLE, 40);
        let attributes = map_attributes(&event, &config(TimeUnit::Native)).unwrap();

        assert_eq!(attributes.get("total_time"), Some(&Value::I64(128)));
        assert_eq!(attributes.get("idle_time"), Some(&Value::I64(40)));
        assert!(!attributes.contains_key("total_time_microseconds"));
    }

    #[test]
    fn absent_data_means_absent_keys() {
        let event = QueryEvent::new("blog.repo").with_statement("SELECT 1");
        let attributes = map_attributes(&event, &config(TimeUnit::Microsecond)).unwrap();

        let keys: Vec<_> = attributes.iter().map(|kv| kv.key.as_str()).collect();
        assert_eq!(keys, vec![DB_TYPE, DB_STATEMENT]);
    }

    #[test]
    fn partial_connection_info() {
        let event = users_event().with_connection_info(
            ConnectionInfo::default()
                .with_system("postgresql")
                .with_database("blog_test")
                .with_host("localhost"),
        );
        let attributes = map_attributes(&event, &config(TimeUnit::Microsecond)).unwrap();

        assert_eq!(attributes.get(DB_SYSTEM), Some(&Value::from("postgresql".to_string())));
        assert_eq!(attributes.get(DB_NAME), Some(&Value::from("blog_test".to_string())));
        assert_eq!(attributes.get(DB_INSTANCE), Some(&Value::from("blog_test".to_string())));
        assert_eq!(attributes.get(NET_PEER_NAME), Some(&Value::from("localhost".to_string())));
        assert!(!attributes.contains_key(DB_USER));
        assert!(!attributes.contains_key(DB_CONNECTION_STRING));
        assert!(!attributes.contains_key(NET_PEER_PORT));
        assert!(!attributes.contains_key(NET_TRANSPORT));
    }

    #[test]
    fn full_connection_info() {
        let event = users_event().with_connection_info(
            ConnectionInfo::default()
                .with_system("postgresql")
                .with_database("blog_test")
                .with_user("postgres")
                .with_connection_string("ecto://localhost:5432/blog_test")
                .with_host("localhost")
                .with_port(5432)
                .with_transport("ip_tcp"),
        );
        let attributes = map_attributes(&event, &config(TimeUnit::Microsecond)).unwrap();

        assert_eq!(attributes.get(DB_USER), Some(&Value::from("postgres".to_string())));
        assert_eq!(
            attributes.get(DB_CONNECTION_STRING),
            Some(&Value::from("ecto://localhost:5432/blog_test".to_string()))
        );
        assert_eq!(attributes.get(NET_PEER_PORT), Some(&Value::I64(5432)));
        assert_eq!(attributes.get(NET_TRANSPORT), Some(&Value::from("ip_tcp".to_string())));
    }

    #[test]
    fn failure_adds_no_attributes() {
        let ok = map_attributes(&users_event(), &config(TimeUnit::Microsecond)).unwrap();
        let failed = map_attributes(
            &users_event().with_outcome(Outcome::failure("column u0.nope does not exist")),
            &config(TimeUnit::Microsecond),
        )
        .unwrap();

        assert_eq!(ok, failed);
    }

    #[test]
    fn missing_statement_is_an_error() {
        let event = QueryEvent::new("blog.repo").with_query_source("users");

        assert_eq!(
            map_attributes(&event, &config(TimeUnit::Microsecond)),
            Err(QueryEventError::MissingStatement("blog.repo".into()))
        );
    }

    #[test]
    fn additional_attributes_do_not_override() {
        let config = config(TimeUnit::Microsecond).with_additional_attributes([
            KeyValue::new("service.tier", "primary"),
            KeyValue::new(DB_TYPE, "nosql"),
        ]);
        let attributes = map_attributes(&users_event(), &config).unwrap();

        assert_eq!(attributes.get("service.tier"), Some(&Value::from("primary")));
        assert_eq!(attributes.get(DB_TYPE), Some(&Value::from("sql")));
    }

    #[test]
    fn huge_tick_counts_saturate() {
        assert_eq!(
            convert_ticks(u64::MAX, TimeUnit::Native),
            Value::I64(i64::MAX)
        );
    }
}
