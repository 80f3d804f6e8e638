//! Query observation.
//!
//! Every statement run through [`observe`] gets a `db.query` span. When the request
//! context has its debug flag set, the statement, its sanitised arguments and the
//! elapsed time are also logged as a `log.kind = "sql"` record, which the debug
//! formatter highlights and the release formatter writes as a JSON line.

use crate::context::RequestContext;
use regex::Regex;
use std::{fmt, future::Future, sync::LazyLock, time::Instant};
use tracing::{Instrument, info, info_span};

static TYPE_WRAPPER: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[A-Z][A-Za-z0-9_]*\((?s)(.*)\)$").ok());

/// Run `query`, tracing it and logging it for debug requests.
pub async fn observe<F, T, E>(
    ctx: &RequestContext,
    statement: &str,
    args: &[&(dyn fmt::Debug + Sync)],
    query: F,
) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = operation(statement),
        db.statement = statement
    );

    let started = Instant::now();
    let result = query.instrument(span).await;

    if ctx.debug() {
        let elapsed = format!("{:.2?}", started.elapsed());
        let args = sanitize_args(args);
        match &result {
            Ok(_) => info!(
                log.kind = "sql",
                db.statement = statement,
                db.args = %args,
                elapsed = %elapsed,
                "query"
            ),
            Err(err) => info!(
                log.kind = "sql",
                db.statement = statement,
                db.args = %args,
                elapsed = %elapsed,
                error = %err,
                "query failed"
            ),
        }
    }

    result
}

/// First keyword of the statement, upper-cased.
#[must_use]
pub fn operation(statement: &str) -> String {
    statement
        .split_whitespace()
        .next()
        .map(str::to_ascii_uppercase)
        .unwrap_or_default()
}

#[must_use]
pub fn sanitize_args(args: &[&(dyn fmt::Debug + Sync)]) -> String {
    let rendered: Vec<String> = args
        .iter()
        .map(|arg| sanitize_arg(&format!("{arg:?}")))
        .collect();
    format!("[{}]", rendered.join(", "))
}

/// Strip `Some(..)`-style wrappers from a debug rendering; `None` becomes `NULL`.
#[must_use]
pub fn sanitize_arg(rendered: &str) -> String {
    let mut current = rendered.trim().to_string();
    if current == "None" {
        return "NULL".to_string();
    }
    let Some(regex) = TYPE_WRAPPER.as_ref() else {
        return current;
    };
    while let Some(inner) = regex
        .captures(&current)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
    {
        // A tuple wrapper such as `Pair(1, 2)` is kept.
        if !balanced(&inner) {
            break;
        }
        current = inner;
    }
    current
}

fn balanced(inner: &str) -> bool {
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    for c in inner.chars() {
        if in_string {
            match c {
                '\\' if !escaped => escaped = true,
                '"' if !escaped => in_string = false,
                _ => escaped = false,
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            ',' if depth == 0 => return false,
            _ => {}
        }
    }
    depth == 0
}
