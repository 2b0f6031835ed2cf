//! Operator-facing log output.
//!
//! Each line carries a severity bullet instead of a level name:
//! `[*]` info, `[+]` debug and trace, `[!]` warn, `[-]` error.

use std::fmt;

use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

pub fn bullet(level: &Level) -> &'static str {
    match *level {
        Level::INFO => "[*]",
        Level::DEBUG | Level::TRACE => "[+]",
        Level::WARN => "[!]",
        _ => "[-]",
    }
}

/// Event formatter producing `<bullet> <message> <fields>` lines.
#[derive(Debug, Default, Clone, Copy)]
pub struct BulletFormat;

impl<S, N> FormatEvent<S, N> for BulletFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        write!(writer, "{} ", bullet(event.metadata().level()))?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Install the tracing subscriber.
///
/// `RUST_LOG` wins when set; otherwise the level is `debug` with `--debug`
/// and `info` without.
pub fn install_tracing(debug: bool) {
    use tracing_error::ErrorLayer;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let default_level = if debug { "debug" } else { "info" };
    let fmt_layer = fmt::layer()
        .event_format(BulletFormat)
        .with_writer(std::io::stderr);
    let filter_layer =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .with(ErrorLayer::default())
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bullets() {
        assert_eq!(bullet(&Level::INFO), "[*]");
        assert_eq!(bullet(&Level::DEBUG), "[+]");
        assert_eq!(bullet(&Level::TRACE), "[+]");
        assert_eq!(bullet(&Level::WARN), "[!]");
        assert_eq!(bullet(&Level::ERROR), "[-]");
    }
}
