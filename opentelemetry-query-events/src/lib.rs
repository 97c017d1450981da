//! # OpenTelemetry Query Events
//!
//! Turns the "query executed" notifications of a database access layer into
//! OpenTelemetry client spans.
//!
//! The query layer publishes a [`Marker::Start`] when it issues a query and a
//! [`Marker::Stop`] (or [`Marker::Exception`]) when the query returns, on the
//! channel of its data source. A subscribed [`QuerySpanHandler`] opens a span
//! on start, as a child of the span active in the calling thread's
//! [`Context`](opentelemetry::Context), keeps it active while the query runs
//! and ends it on stop with attributes describing the query.
//!
//! Because the parent is taken from the ambient context:
//!
//! * queries issued from different threads under the same parent (parallel
//!   preloads) all report that parent, whatever order they finish in;
//! * a query issued while another query of the same thread is still running
//!   (a nested preload) becomes a child of that query.
//!
//! ## Usage
//!
//! ```
//! use opentelemetry::trace::TracerProvider as _;
//! use opentelemetry_query_events::{
//!     attach_with_tracer, channel_id, detach, dispatch, event::timing, HandlerConfig, Marker,
//!     QueryEvent,
//! };
//! use opentelemetry_sdk::trace::{InMemorySpanExporter, SdkTracerProvider};
//! use std::time::SystemTime;
//!
//! let exporter = InMemorySpanExporter::default();
//! let provider = SdkTracerProvider::builder()
//!     .with_simple_exporter(exporter.clone())
//!     .build();
//!
//! // Application side: subscribe once at startup.
//! let handle = attach_with_tracer(
//!     "blog.repo",
//!     HandlerConfig::default(),
//!     provider.tracer("blog"),
//! )
//! .unwrap();
//!
//! // Query layer side: publish around every query.
//! let channel = channel_id("blog.repo");
//! let event = QueryEvent::new("blog.repo")
//!     .with_query_source("users")
//!     .with_statement("SELECT u0.\"id\" FROM \"users\" AS u0")
//!     .with_timing(timing::TOTAL, 128);
//! dispatch(&channel, Marker::Start(SystemTime::now()), &event);
//! dispatch(&channel, Marker::Stop(SystemTime::now()), &event);
//!
//! detach(&handle).unwrap();
//! assert_eq!(exporter.get_finished_spans().unwrap()[0].name, "blog.repo:users");
//! ```
//!
//! ## Span attributes
//!
//! | Attribute | Source |
//! |-----------|--------|
//! | `db.type` | always `sql` |
//! | `db.statement` | query text |
//! | `db.sql.table` | query source |
//! | `db.system`, `db.name`, `db.instance`, `db.user`, `db.connection_string` | connection info |
//! | `net.peer.name`, `net.peer.port`, `net.transport` | connection info |
//! | `{category}_time_{unit}` | one per reported timing, see [`TimeUnit`] |
//!
//! Attributes are only set when the event carries the underlying data. A
//! failed query sets the span status to error with the database error text.
//!
//! ## Limitations
//!
//! Start and stop markers of a query must be published from the same thread,
//! without yielding to another task in between. A query whose stop marker
//! never arrives leaves its span open and its context attached on that thread.
#![warn(
    future_incompatible,
    missing_debug_implementations,
    missing_docs,
    nonstandard_style,
    rust_2018_idioms,
    unreachable_pub,
    unused
)]
#![cfg_attr(docsrs, feature(doc_cfg), deny(rustdoc::broken_intra_doc_links))]
#![doc(
    html_logo_url = "https://raw.githubusercontent.com/open-telemetry/opentelemetry-rust/main/assets/logo.svg"
)]

pub mod attributes;
mod config;
mod error;
pub mod event;
mod handler;
mod subscriber;

pub use attributes::{map_attributes, AttributeSet};
pub use config::{
    HandlerConfig, TimeUnit, OTEL_QUERY_EVENTS_SPAN_PREFIX, OTEL_QUERY_EVENTS_TIME_UNIT,
};
pub use error::{QueryEventError, QueryEventResult};
pub use event::{ConnectionInfo, Marker, Outcome, QueryEvent};
pub use handler::{active_query_depth, QuerySpanHandler, DEFAULT_QUERY_SOURCE};
pub use subscriber::{
    attach, attach_handler, attach_with_tracer, channel_id, detach, dispatch, is_attached,
    QueryEventHandler, SubscriptionHandle, QUERY_CHANNEL_SUFFIX,
};
