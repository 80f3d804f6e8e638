//! Human-oriented event format used in debug mode.
//!
//! Events tagged `log.kind = "http" | "grpc" | "sql"` get dedicated layouts; anything
//! else renders as `time level message key=value...` followed by the fields of the
//! enclosing spans.

use nu_ansi_term::{Color, Style};
use regex::Regex;
use std::{
    fmt::{self, Write as _},
    sync::LazyLock,
};
use tracing::{
    Event, Level, Subscriber,
    field::{Field, Visit},
};
use tracing_subscriber::{
    fmt::{FmtContext, FormatEvent, FormatFields, FormattedFields, format::Writer},
    registry::LookupSpan,
};

static SQL_KEYWORDS: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(select|from|where|insert|into|values|update|set|delete|returning|join|left|inner|on|and|or|not|null|order by|group by|limit|offset|for update|skip locked|begin|commit|rollback|as|in|is|now)\b",
    )
    .ok()
});

#[derive(Debug, Clone, Copy, Default)]
pub struct DebugFormat;

#[derive(Default)]
struct Fields {
    message: Option<String>,
    kind: Option<String>,
    values: Vec<(&'static str, String)>,
}

impl Fields {
    fn get(&self, name: &str) -> Option<&str> {
        self.values
            .iter()
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value.as_str())
    }
}

impl Visit for Fields {
    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.message = Some(value.to_string()),
            "log.kind" => self.kind = Some(value.to_string()),
            name => self.values.push((name, value.to_string())),
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.record_str(field, &format!("{value:?}"));
    }
}

struct Painter {
    ansi: bool,
}

impl Painter {
    fn paint(&self, style: Style, text: &str) -> String {
        if self.ansi {
            style.paint(text).to_string()
        } else {
            text.to_string()
        }
    }

    fn level(&self, level: Level) -> String {
        let style = match level {
            Level::ERROR => Color::Red.bold(),
            Level::WARN => Color::Yellow.bold(),
            Level::INFO => Color::Green.normal(),
            Level::DEBUG => Color::Blue.normal(),
            Level::TRACE => Color::Purple.normal(),
        };
        self.paint(style, &format!("{:>5}", level.as_str()))
    }

    fn status(&self, status: &str) -> String {
        let style = match status.chars().next() {
            Some('2') => Color::Green.bold(),
            Some('3') => Color::Cyan.bold(),
            Some('4') => Color::Yellow.bold(),
            Some('5') => Color::Red.bold(),
            _ => Style::new().bold(),
        };
        self.paint(style, status)
    }

    fn code(&self, code: &str) -> String {
        let style = if code == "Ok" {
            Color::Green.bold()
        } else {
            Color::Red.bold()
        };
        self.paint(style, code)
    }

    fn dim(&self, text: &str) -> String {
        self.paint(Style::new().dimmed(), text)
    }
}

/// Upper-case and colour SQL keywords.
#[must_use]
pub fn highlight_sql(sql: &str, ansi: bool) -> String {
    let Some(regex) = SQL_KEYWORDS.as_ref() else {
        return sql.to_string();
    };
    regex
        .replace_all(sql, |caps: &regex::Captures<'_>| {
            let keyword = caps[0].to_ascii_uppercase();
            if ansi {
                Color::Magenta.bold().paint(keyword).to_string()
            } else {
                keyword
            }
        })
        .into_owned()
}

impl<S, N> FormatEvent<S, N> for DebugFormat
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
        let painter = Painter {
            ansi: writer.has_ansi_escapes(),
        };
        let mut fields = Fields::default();
        event.record(&mut fields);

        let time = chrono::Local::now().format("%H:%M:%S%.3f").to_string();
        let level = painter.level(*event.metadata().level());
        write!(writer, "{} {} ", painter.dim(&time), level)?;

        match fields.kind.as_deref() {
            Some("http") => write_http(&mut writer, &painter, &fields)?,
            Some("grpc") => write_grpc(&mut writer, &painter, &fields)?,
            Some("sql") => write_sql(&mut writer, &painter, &fields)?,
            _ => write_generic(&mut writer, &painter, &fields, ctx)?,
        }

        writeln!(writer)
    }
}

fn write_http(writer: &mut Writer<'_>, painter: &Painter, fields: &Fields) -> fmt::Result {
    let method = fields.get("method").unwrap_or("-");
    let path = fields.get("path").unwrap_or("-");
    let status = fields.get("status").unwrap_or("-");
    let latency = fields.get("latency").unwrap_or("-");
    let client_ip = fields.get("client_ip").unwrap_or("-");

    write!(
        writer,
        "{} {} {} {} {}",
        painter.paint(Style::new().bold(), method),
        path,
        painter.status(status),
        latency,
        painter.dim(client_ip),
    )?;
    if let Some(headers) = fields.get("headers").filter(|h| !h.is_empty()) {
        write!(writer, "\n{headers}")?;
    }
    Ok(())
}

fn write_grpc(writer: &mut Writer<'_>, painter: &Painter, fields: &Fields) -> fmt::Result {
    let service = fields.get("rpc.service").unwrap_or("-");
    let method = fields.get("rpc.method").unwrap_or("-");
    let code = fields.get("rpc.code").unwrap_or("-");

    write!(
        writer,
        "gRPC {}/{} {}",
        service,
        painter.paint(Style::new().bold(), method),
        painter.code(code),
    )?;
    if let Some(latency) = fields.get("latency") {
        write!(writer, " {latency}")?;
    }
    if let Some(message) = fields.get("rpc.message").filter(|m| !m.is_empty()) {
        write!(writer, " {}", painter.dim(message))?;
    }
    Ok(())
}

fn write_sql(writer: &mut Writer<'_>, painter: &Painter, fields: &Fields) -> fmt::Result {
    let statement = fields.get("db.statement").unwrap_or("");
    let elapsed = fields.get("elapsed").unwrap_or("-");
    write!(
        writer,
        "{} {}\n    {}",
        painter.paint(Color::Cyan.bold(), "SQL"),
        elapsed,
        highlight_sql(statement.trim(), painter.ansi)
    )?;
    if let Some(args) = fields.get("db.args").filter(|a| !a.is_empty() && *a != "[]") {
        write!(writer, "\n    {} {}", painter.dim("args:"), args)?;
    }
    Ok(())
}

fn write_generic<S, N>(
    writer: &mut Writer<'_>,
    painter: &Painter,
    fields: &Fields,
    ctx: &FmtContext<'_, S, N>,
) -> fmt::Result
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    writer.write_str(fields.message.as_deref().unwrap_or(""))?;

    let mut pairs = String::new();
    for (key, value) in &fields.values {
        let _ = write!(pairs, " {}={}", painter.dim(key), value);
    }

    if let Some(scope) = ctx.event_scope() {
        for span in scope.from_root() {
            let extensions = span.extensions();
            if let Some(formatted) = extensions.get::<FormattedFields<N>>()
                && !formatted.fields.is_empty()
            {
                let rendered = format!("{}{{{}}}", span.name(), formatted.fields);
                let _ = write!(pairs, " {}", painter.dim(&rendered));
            }
        }
    }

    writer.write_str(&pairs)
}
