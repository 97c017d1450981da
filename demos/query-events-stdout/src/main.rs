//! run with `$ cargo run --bin query-events-stdout`

use opentelemetry::trace::{Tracer, TracerProvider as _};
use opentelemetry::Context;
use opentelemetry_query_events::{
    attach_with_tracer, channel_id, detach, dispatch, event::timing, ConnectionInfo,
    HandlerConfig, Marker, Outcome, QueryEvent,
};
use opentelemetry_sdk::trace::SdkTracerProvider;
use std::error::Error;
use std::thread;
use std::time::{Duration, Instant, SystemTime};
use tracing::info;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

const REPO: &str = "blog.repo";

/// A stand-in for a database access layer that publishes a notification
/// around every query it runs.
struct Repo {
    channel: String,
    connection: ConnectionInfo,
}

impl Repo {
    fn new(name: &str) -> Self {
        Repo {
            channel: channel_id(name),
            connection: ConnectionInfo::default()
                .with_system("postgresql")
                .with_database("blog_dev")
                .with_user("postgres")
                .with_host("localhost")
                .with_port(5432)
                .with_transport("ip_tcp"),
        }
    }

    /// Runs a query against `table`. `preload` runs while the query is still
    /// open, like a preload resolved inside the query.
    fn query(&self, table: &str, preload: impl FnOnce(), outcome: Outcome) {
        let queued = Duration::from_micros(40);
        let started = Instant::now();
        let event = QueryEvent::new(REPO)
            .with_query_source(table)
            .with_statement(format!("SELECT t0.\"id\" FROM \"{table}\" AS t0"));
        dispatch(&self.channel, Marker::Start(SystemTime::now()), &event);

        thread::sleep(Duration::from_millis(2));
        preload();

        let elapsed = started.elapsed();
        let event = event
            .with_timing_duration(timing::QUEUE, queued)
            .with_timing_duration(timing::QUERY, elapsed)
            .with_timing_duration(timing::DECODE, Duration::from_micros(15))
            .with_timing_duration(timing::TOTAL, queued + elapsed)
            .with_connection_info(self.connection.clone())
            .with_outcome(outcome);
        dispatch(&self.channel, Marker::Stop(SystemTime::now()), &event);
    }
}

fn init_logs() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .init();
}

fn main() -> Result<(), Box<dyn Error + Send + Sync + 'static>> {
    init_logs();

    let provider = SdkTracerProvider::builder()
        .with_simple_exporter(opentelemetry_stdout::SpanExporter::default())
        .build();
    let handle = attach_with_tracer(
        REPO,
        HandlerConfig::default(),
        provider.tracer("query-events-stdout"),
    )?;
    info!(channel = handle.channel(), "subscribed to query events");

    let repo = Repo::new(REPO);
    let tracer = provider.tracer("query-events-stdout");
    tracer.in_span("GET /users", |_cx| {
        // A nested preload: `posts` runs while `users` is still open.
        repo.query(
            "users",
            || repo.query("posts", || {}, Outcome::Success),
            Outcome::Success,
        );

        // Parallel preloads: each thread inherits the request context.
        let request_cx = Context::current();
        thread::scope(|s| {
            for table in ["comments", "tags"] {
                let cx = request_cx.clone();
                let repo = &repo;
                s.spawn(move || {
                    let _guard = cx.attach();
                    repo.query(table, || {}, Outcome::Success);
                });
            }
        });

        repo.query(
            "users",
            || {},
            Outcome::failure("ERROR 42703 (undefined_column) column t0.nope does not exist"),
        );
    });

    detach(&handle)?;
    provider.shutdown()?;
    Ok(())
}
