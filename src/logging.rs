// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Tracing setup and the process-wide quiet flag.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use time::OffsetDateTime;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::{format, FmtContext, FormatEvent, FormatFields, FormattedFields};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Set once while parsing CLI args; read by the startup banner and by each
/// zone's own banner line to decide whether to print anything at all.
static QUIET: AtomicBool = AtomicBool::new(false);

pub fn set_quiet(quiet: bool) {
    QUIET.store(quiet, Ordering::Relaxed);
}

pub fn is_quiet() -> bool {
    QUIET.load(Ordering::Relaxed)
}

/// Install the global tracing subscriber. `quiet` maps to `ERROR`, `debug`
/// maps to `DEBUG`, otherwise `INFO`; `RUST_LOG` still overrides per-target.
pub fn init(quiet: bool, debug: bool) -> Result<(), String> {
    set_quiet(quiet);
    let level = match (quiet, debug) {
        (true, _) => Level::ERROR,
        (_, true) => Level::DEBUG,
        _ => Level::INFO,
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().event_format(FlexdnsFormatter))
        .with(
            EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env()
                .map_err(|err| format!("failed to parse environment variable for tracing: {err}"))?,
        )
        .init();

    Ok(())
}

/// `unix_secs:LEVEL:target[:line][:span{fields}]:fields`.
struct FlexdnsFormatter;

impl<S, N> FormatEvent<S, N> for FlexdnsFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let now_secs = OffsetDateTime::now_utc().unix_timestamp();

        let metadata = event.metadata();
        write!(&mut writer, "{}:{}:{}", now_secs, metadata.level(), metadata.target())?;

        if let Some(line) = metadata.line() {
            write!(&mut writer, ":{line}")?;
        }

        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                write!(writer, ":{}", span.name())?;

                let ext = span.extensions();
                let fields = &ext.get::<FormattedFields<N>>().expect("will never be `None`");
                if !fields.is_empty() {
                    write!(writer, "{{{fields}}}")?;
                }
            }
        }

        write!(writer, ":")?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}
