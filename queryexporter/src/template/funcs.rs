//! The function library available to query templates.
use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, NaiveTime, TimeZone};

use super::{Datum, TemplateError};
use crate::common::parse_duration;

/// Names of every function a template may call.
pub const FUNCTIONS: &[&str] = &[
    // strings
    "upper", "lower", "title", "trim", "trimAll", "trimPrefix", "trimSuffix", "replace", "repeat",
    "quote", "squote", "cat", "nospace", "trunc", "contains", "hasPrefix", "hasSuffix", "snakecase",
    "kebabcase", "camelcase", "substr",
    // conversion
    "default", "toString", "int", "float64",
    // math
    "add", "add1", "sub", "mul", "div", "mod", "max", "min",
    // dates
    "now", "date", "unixEpoch", "dateModify", "toDate", "htmlDate",
];

pub(super) fn is_function(name: &str) -> bool {
    FUNCTIONS.contains(&name)
}

fn failed(func: &str, message: impl Into<String>) -> TemplateError {
    TemplateError::Call { func: func.to_owned(), message: message.into() }
}

fn expect_args(func: &str, args: &[Datum], min: usize, max: Option<usize>) -> Result<(), TemplateError> {
    let n = args.len();
    let ok = n >= min && max.map_or(true, |max| n <= max);
    if ok {
        return Ok(());
    }
    let wanted = match max {
        Some(max) if max == min => format!("{min}"),
        Some(max) => format!("{min} to {max}"),
        None => format!("at least {min}"),
    };
    Err(failed(func, format!("wrong number of args: want {wanted}, got {n}")))
}

fn time_arg(func: &str, value: &Datum) -> Result<DateTime<Local>, TemplateError> {
    match value {
        Datum::Time(t) => Ok(*t),
        Datum::Int(secs) => Local
            .timestamp_opt(*secs, 0)
            .single()
            .ok_or_else(|| failed(func, format!("timestamp {secs} out of range"))),
        other => Err(failed(func, format!("expected a date, got {}", other.kind()))),
    }
}

/// Calls the function `name` with already evaluated arguments.
pub(super) fn call(name: &str, mut args: Vec<Datum>) -> Result<Datum, TemplateError> {
    let s = |i: usize, args: &[Datum]| args[i].to_string();

    let value = match name {
        "upper" | "lower" | "title" | "trim" | "nospace" | "snakecase" | "kebabcase" | "camelcase"
        | "toString" | "quote" | "squote" | "cat" => {
            match name {
                "quote" | "squote" | "cat" => {}
                _ => expect_args(name, &args, 1, Some(1))?,
            }
            let strings = args.iter().map(Datum::to_string);
            Datum::Str(match name {
                "upper" => s(0, &args).to_uppercase(),
                "lower" => s(0, &args).to_lowercase(),
                "title" => title(&s(0, &args)),
                "trim" => s(0, &args).trim().to_owned(),
                "nospace" => s(0, &args).chars().filter(|c| !c.is_whitespace()).collect(),
                "snakecase" => separate_words(&s(0, &args), '_'),
                "kebabcase" => separate_words(&s(0, &args), '-'),
                "camelcase" => camelcase(&s(0, &args)),
                "toString" => s(0, &args),
                "quote" => strings.map(|v| format!("{v:?}")).collect::<Vec<_>>().join(" "),
                "squote" => strings.map(|v| format!("'{v}'")).collect::<Vec<_>>().join(" "),
                _ => strings.collect::<Vec<_>>().join(" "),
            })
        }
        "trimAll" | "trimPrefix" | "trimSuffix" | "contains" | "hasPrefix" | "hasSuffix" => {
            expect_args(name, &args, 2, Some(2))?;
            let (arg, target) = (s(0, &args), s(1, &args));
            match name {
                "trimAll" => Datum::Str(target.trim_matches(|c: char| arg.contains(c)).to_owned()),
                "trimPrefix" => Datum::Str(target.strip_prefix(arg.as_str()).unwrap_or(&target).to_owned()),
                "trimSuffix" => Datum::Str(target.strip_suffix(arg.as_str()).unwrap_or(&target).to_owned()),
                "contains" => Datum::Bool(target.contains(arg.as_str())),
                "hasPrefix" => Datum::Bool(target.starts_with(arg.as_str())),
                _ => Datum::Bool(target.ends_with(arg.as_str())),
            }
        }
        "replace" => {
            expect_args(name, &args, 3, Some(3))?;
            Datum::Str(s(2, &args).replace(&s(0, &args), &s(1, &args)))
        }
        "repeat" => {
            expect_args(name, &args, 2, Some(2))?;
            let count = usize::try_from(args[0].to_i64()).map_err(|_| failed(name, "negative count"))?;
            Datum::Str(s(1, &args).repeat(count))
        }
        "trunc" => {
            expect_args(name, &args, 2, Some(2))?;
            let (n, chars) = (args[0].to_i64(), s(1, &args).chars().collect::<Vec<_>>());
            let len = chars.len() as i64;
            Datum::Str(match n {
                n if n >= 0 => chars[..n.min(len) as usize].iter().collect(),
                n => chars[(len + n).max(0) as usize..].iter().collect(),
            })
        }
        "substr" => {
            expect_args(name, &args, 3, Some(3))?;
            let (start, end) = (args[0].to_i64(), args[1].to_i64());
            let chars = s(2, &args).chars().collect::<Vec<_>>();
            let len = chars.len() as i64;
            let start = start.clamp(0, len) as usize;
            let end = if end < 0 || end > len { len as usize } else { end as usize };
            Datum::Str(if start <= end { chars[start..end].iter().collect() } else { String::new() })
        }
        "default" => {
            expect_args(name, &args, 1, Some(2))?;
            match args.pop() {
                Some(given) if args.len() == 1 && !given.is_empty() => given,
                Some(given) if args.is_empty() => given,
                _ => args.remove(0),
            }
        }
        "int" => {
            expect_args(name, &args, 1, Some(1))?;
            Datum::Int(args[0].to_i64())
        }
        "float64" => {
            expect_args(name, &args, 1, Some(1))?;
            Datum::Float(args[0].to_f64())
        }
        "add" | "mul" | "max" | "min" => {
            expect_args(name, &args, 1, None)?;
            let mut numbers = args.iter().map(Datum::to_i64);
            let first = numbers.next().unwrap_or_default();
            Datum::Int(numbers.fold(first, |acc, n| match name {
                "add" => acc.wrapping_add(n),
                "mul" => acc.wrapping_mul(n),
                "max" => acc.max(n),
                _ => acc.min(n),
            }))
        }
        "add1" => {
            expect_args(name, &args, 1, Some(1))?;
            Datum::Int(args[0].to_i64().wrapping_add(1))
        }
        "sub" | "div" | "mod" => {
            expect_args(name, &args, 2, Some(2))?;
            let (a, b) = (args[0].to_i64(), args[1].to_i64());
            Datum::Int(match name {
                "sub" => a.wrapping_sub(b),
                _ if b == 0 => return Err(failed(name, "integer divide by zero")),
                "div" => a.wrapping_div(b),
                _ => a.wrapping_rem(b),
            })
        }
        "now" => {
            expect_args(name, &args, 0, Some(0))?;
            Datum::Time(Local::now())
        }
        "date" => {
            expect_args(name, &args, 2, Some(2))?;
            let t = time_arg(name, &args[1])?;
            Datum::Str(t.format(&go_layout_to_chrono(&s(0, &args))).to_string())
        }
        "htmlDate" => {
            expect_args(name, &args, 1, Some(1))?;
            Datum::Str(time_arg(name, &args[0])?.format("%Y-%m-%d").to_string())
        }
        "unixEpoch" => {
            expect_args(name, &args, 1, Some(1))?;
            Datum::Str(time_arg(name, &args[0])?.timestamp().to_string())
        }
        "dateModify" => {
            expect_args(name, &args, 2, Some(2))?;
            let delta = parse_duration(&s(0, &args)).map_err(|e| failed(name, e.to_string()))?;
            let t = time_arg(name, &args[1])?;
            Datum::Time(t.checked_add_signed(delta).ok_or_else(|| failed(name, "date out of range"))?)
        }
        "toDate" => {
            expect_args(name, &args, 2, Some(2))?;
            Datum::Time(parse_date(&s(0, &args), &s(1, &args)).map_err(|message| failed(name, message))?)
        }
        _ => return Err(failed(name, "function not defined")),
    };
    Ok(value)
}

fn title(input: &str) -> String {
    let mut output = String::with_capacity(input.len());
    let mut at_word_start = true;
    for c in input.chars() {
        if at_word_start {
            output.extend(c.to_uppercase());
        } else {
            output.push(c);
        }
        at_word_start = c.is_whitespace();
    }
    output
}

/// Lowercases `input`, separating words with `sep`.
///
/// A word starts at every transition from lower case or digit to upper case, and before the last
/// upper case letter of an acronym followed by lower case (`HTTPServer` becomes `http_server`).
fn separate_words(input: &str, sep: char) -> String {
    let chars = input.chars().collect::<Vec<_>>();
    let mut output = String::with_capacity(input.len() + 4);

    for (i, &c) in chars.iter().enumerate() {
        if c == '_' || c == '-' || c.is_whitespace() {
            if !output.is_empty() && !output.ends_with(sep) {
                output.push(sep);
            }
            continue;
        }
        if c.is_uppercase() && i > 0 {
            let prev = chars[i - 1];
            let next_is_lower = chars.get(i + 1).is_some_and(|n| n.is_lowercase());
            let boundary = prev.is_lowercase()
                || prev.is_ascii_digit()
                || (prev.is_uppercase() && next_is_lower);
            if boundary && !output.ends_with(sep) {
                output.push(sep);
            }
        }
        output.extend(c.to_lowercase());
    }

    output.trim_end_matches(sep).to_owned()
}

fn camelcase(input: &str) -> String {
    input
        .split(|c: char| c == '_' || c == '-' || c.is_whitespace())
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            chars.next().map(|first| first.to_uppercase().chain(chars).collect::<String>()).unwrap_or_default()
        })
        .collect()
}

/// Converts a reference-time layout (`2006-01-02 15:04:05`) into a chrono format string.
pub fn go_layout_to_chrono(layout: &str) -> String {
    const TOKENS: &[(&str, &str)] = &[
        ("January", "%B"),
        ("Monday", "%A"),
        ("Z07:00", "%:z"),
        ("-07:00", "%:z"),
        (".000000000", "%.9f"),
        (".000000", "%.6f"),
        (".000", "%.3f"),
        ("-0700", "%z"),
        ("2006", "%Y"),
        ("Jan", "%b"),
        ("Mon", "%a"),
        ("MST", "%Z"),
        ("002", "%j"),
        ("_2", "%e"),
        ("01", "%m"),
        ("02", "%d"),
        ("03", "%I"),
        ("04", "%M"),
        ("05", "%S"),
        ("06", "%y"),
        ("15", "%H"),
        ("PM", "%p"),
        ("pm", "%P"),
        ("1", "%-m"),
        ("2", "%-d"),
        ("3", "%-I"),
        ("4", "%-M"),
        ("5", "%-S"),
    ];

    let mut output = String::with_capacity(layout.len() * 2);
    let mut rest = layout;
    'outer: while let Some(c) = rest.chars().next() {
        for (token, format) in TOKENS {
            if let Some(after) = rest.strip_prefix(token) {
                output.push_str(format);
                rest = after;
                continue 'outer;
            }
        }
        if c == '%' {
            output.push_str("%%");
        } else {
            output.push(c);
        }
        rest = &rest[c.len_utf8()..];
    }
    output
}

fn parse_date(layout: &str, input: &str) -> Result<DateTime<Local>, String> {
    let format = go_layout_to_chrono(layout);

    if let Ok(t) = DateTime::parse_from_str(input, &format) {
        return Ok(t.with_timezone(&Local));
    }
    let naive = match NaiveDateTime::parse_from_str(input, &format) {
        Ok(naive) => naive,
        Err(_) => NaiveDate::parse_from_str(input, &format)
            .map_err(|e| format!("cannot parse {input:?} as {layout:?}: {e}"))?
            .and_time(NaiveTime::default()),
    };
    Local
        .from_local_datetime(&naive)
        .earliest()
        .ok_or_else(|| format!("{input:?} does not exist in the local time zone"))
}
