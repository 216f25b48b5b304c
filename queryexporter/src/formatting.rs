//! Helpers for rendering samples in the Prometheus exposition format.
use std::collections::BTreeMap;
use std::fmt::Write as _;

use metrics_util::MetricKind;

use crate::projector::Sample;

/// Renders samples in the Prometheus text [exposition format].
///
/// Samples are grouped into families by metric name. Families are sorted by name and the series
/// of a family by their label values, constant labels included. When several samples share
/// identical label values, only the first one is kept.
///
/// [exposition format]: https://github.com/prometheus/docs/blob/main/content/docs/instrumenting/exposition_formats.md#text-format-details
pub fn render<'a, I>(samples: I) -> String
where
    I: IntoIterator<Item = &'a Sample>,
{
    let mut families: BTreeMap<&str, Vec<&Sample>> = BTreeMap::new();
    for sample in samples {
        families.entry(sample.desc().fq_name()).or_default().push(sample);
    }

    let mut output = String::new();
    for (name, mut series) in families {
        let first: &Sample = series[0];
        let desc = first.desc();
        if !desc.help().is_empty() {
            write_help_line(&mut output, name, desc.help());
        }
        write_type_line(&mut output, name, desc.kind());

        series.sort_by(|a, b| series_labels(a).cmp(&series_labels(b)));
        series.dedup_by(|a, b| series_labels(a) == series_labels(b));

        for sample in series {
            write_metric_line(&mut output, sample);
        }
    }
    output
}

fn series_labels(sample: &Sample) -> (&[String], &[(String, String)]) {
    (sample.label_values(), sample.desc().const_labels())
}

/// Writes a help (description) line in the Prometheus [exposition format].
///
/// [exposition format]: https://github.com/prometheus/docs/blob/main/content/docs/instrumenting/exposition_formats.md#text-format-details
pub fn write_help_line(buffer: &mut String, name: &str, desc: &str) {
    buffer.push_str("# HELP ");
    buffer.push_str(name);
    buffer.push(' ');
    buffer.push_str(&sanitize_description(desc));
    buffer.push('\n');
}

/// Writes a metric type line in the Prometheus [exposition format].
///
/// [exposition format]: https://github.com/prometheus/docs/blob/main/content/docs/instrumenting/exposition_formats.md#text-format-details
pub fn write_type_line(buffer: &mut String, name: &str, kind: MetricKind) {
    buffer.push_str("# TYPE ");
    buffer.push_str(name);
    buffer.push(' ');
    buffer.push_str(match kind {
        MetricKind::Counter => "counter",
        MetricKind::Gauge => "gauge",
        MetricKind::Histogram => "histogram",
    });
    buffer.push('\n');
}

/// Writes a single series line for a sample in the Prometheus [exposition format].
///
/// Dynamic labels come first, in descriptor order, followed by the constant labels. Labels with
/// an empty value are still written.
///
/// [exposition format]: https://github.com/prometheus/docs/blob/main/content/docs/instrumenting/exposition_formats.md#text-format-details
pub fn write_metric_line(buffer: &mut String, sample: &Sample) {
    let desc = sample.desc();
    buffer.push_str(desc.fq_name());

    let labels = desc
        .label_names()
        .iter()
        .zip(sample.label_values())
        .chain(desc.const_labels().iter().map(|(k, v)| (k, v)));

    let mut first = true;
    for (key, value) in labels {
        buffer.push(if first { '{' } else { ',' });
        first = false;
        buffer.push_str(key);
        buffer.push_str("=\"");
        buffer.push_str(&sanitize_label_value(value));
        buffer.push('"');
    }
    if !first {
        buffer.push('}');
    }

    buffer.push(' ');
    write_value(buffer, sample.value());
    buffer.push('\n');
}

fn write_value(buffer: &mut String, value: f64) {
    if value.is_nan() {
        buffer.push_str("NaN");
    } else if value.is_infinite() {
        buffer.push_str(if value.is_sign_positive() { "+Inf" } else { "-Inf" });
    } else {
        let _ = write!(buffer, "{value}");
    }
}

/// Sanitizes a metric name to be valid under the Prometheus [data model].
///
/// [data model]: https://prometheus.io/docs/concepts/data_model/#metric-names-and-labels
pub fn sanitize_metric_name(name: &str) -> String {
    // The first character must be [a-zA-Z_:], and all subsequent characters must be [a-zA-Z0-9_:].
    name.chars()
        .enumerate()
        .map(|(i, c)| {
            if i == 0 && valid_metric_name_start_character(c)
                || i != 0 && valid_metric_name_character(c)
            {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Sanitizes a label key to be valid under the Prometheus [data model].
///
/// [data model]: https://prometheus.io/docs/concepts/data_model/#metric-names-and-labels
pub fn sanitize_label_key(key: &str) -> String {
    // The first character must be [a-zA-Z_], and all subsequent characters must be [a-zA-Z0-9_].
    key.chars()
        .enumerate()
        .map(|(i, c)| {
            if i == 0 && valid_label_key_start_character(c)
                || i != 0 && valid_label_key_character(c)
            {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Sanitizes a label value to be valid under the Prometheus [data model].
///
/// [data model]: https://prometheus.io/docs/concepts/data_model/#metric-names-and-labels
pub fn sanitize_label_value(value: &str) -> String {
    sanitize_label_value_or_description(value, false)
}

/// Sanitizes a metric description to be valid under the Prometheus [exposition format].
///
/// [exposition format]: https://github.com/prometheus/docs/blob/main/content/docs/instrumenting/exposition_formats.md#text-format-details
pub fn sanitize_description(value: &str) -> String {
    sanitize_label_value_or_description(value, true)
}

fn sanitize_label_value_or_description(value: &str, is_desc: bool) -> String {
    // All Unicode characters are valid, but backslashes, double quotes, and line feeds must be
    // escaped.
    let mut sanitized = String::with_capacity(value.len());

    let mut previous_backslash = false;
    for c in value.chars() {
        match c {
            // Any raw newlines get escaped, period.
            '\n' => sanitized.push_str("\\n"),
            // Any double quote we see gets escaped, but only for label values, not descriptions.
            '"' if !is_desc => {
                previous_backslash = false;
                sanitized.push_str("\\\"");
            }
            // If we see a backslash, we might be either seeing one that is being used to escape
            // something, or seeing one that has being escaped. If our last character was a
            // backslash, then we know this one has already been escaped, and we just emit the
            // escaped backslash.
            '\\' => {
                if previous_backslash {
                    // This backslash was preceded by another backslash, so we can safely emit an
                    // escaped backslash.
                    sanitized.push_str("\\\\");
                }

                // This may or may not be a backslash that is about to escape something else, so if
                // we toggle the value here: if it was false, then we're marking ourselves as having
                // seen a previous backslash (duh) or we just emitted an escaped backslash and now
                // we're clearing the flag.
                previous_backslash = !previous_backslash;
            }
            c => {
                // If we had a backslash in holding, and we're here, we know it wasn't escaping
                // something we care about, so it's on its own, and we emit an escaped backslash,
                // before emitting the actual character we're handling.
                if previous_backslash {
                    previous_backslash = false;
                    sanitized.push_str("\\\\");
                }
                sanitized.push(c);
            }
        }
    }

    // Handle any dangling backslash by writing it out in an escaped fashion.
    if previous_backslash {
        sanitized.push_str("\\\\");
    }

    sanitized
}

#[inline]
fn valid_metric_name_start_character(c: char) -> bool {
    // Essentially, needs to match the regex pattern of [a-zA-Z_:].
    c.is_ascii_alphabetic() || c == '_' || c == ':'
}

#[inline]
fn valid_metric_name_character(c: char) -> bool {
    // Essentially, needs to match the regex pattern of [a-zA-Z0-9_:].
    c.is_ascii_alphanumeric() || c == '_' || c == ':'
}

#[inline]
fn valid_label_key_start_character(c: char) -> bool {
    // Essentially, needs to match the regex pattern of [a-zA-Z_].
    c.is_ascii_alphabetic() || c == '_'
}

#[inline]
fn valid_label_key_character(c: char) -> bool {
    // Essentially, needs to match the regex pattern of [a-zA-Z0-9_].
    c.is_ascii_alphanumeric() || c == '_'
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use crate::desc::Desc;
    use crate::formatting::{
        render, sanitize_description, sanitize_label_key, sanitize_label_value, sanitize_metric_name,
        valid_label_key_character, valid_label_key_start_character, valid_metric_name_character,
        valid_metric_name_start_character,
    };
    use crate::projector::Sample;
    use metrics_util::MetricKind;
    use proptest::prelude::*;

    fn sample(desc: &Arc<Desc>, value: f64, labels: &[&str]) -> Sample {
        Sample::new(desc.clone(), value, labels.iter().map(|l| (*l).to_owned()).collect())
    }

    #[test]
    fn test_render_families() {
        let mut consts = BTreeMap::new();
        consts.insert("team".to_owned(), "core".to_owned());
        let users = Arc::new(Desc::new(
            "qe_postgres_users",
            "Number of \"active\" users.\nPer status.",
            ["status", "name"],
            &consts,
            MetricKind::Gauge,
        ));
        let scrapes = Arc::new(Desc::new(
            "qe_total_scrapes",
            "Current total scrapes.",
            ["driver"],
            &BTreeMap::new(),
            MetricKind::Counter,
        ));
        let empty = Arc::new(Desc::new("qe_bare", "", Vec::<String>::new(), &BTreeMap::new(), MetricKind::Gauge));

        let samples = vec![
            sample(&users, 3.0, &["inactive", "db1"]),
            sample(&scrapes, 7.0, &["redis"]),
            sample(&users, 42.5, &["active", "db\"1"]),
            sample(&empty, f64::NAN, &[]),
        ];

        let expected = concat!(
            "# TYPE qe_bare gauge\n",
            "qe_bare NaN\n",
            "# HELP qe_postgres_users Number of \"active\" users.\\nPer status.\n",
            "# TYPE qe_postgres_users gauge\n",
            "qe_postgres_users{status=\"active\",name=\"db\\\"1\",team=\"core\"} 42.5\n",
            "qe_postgres_users{status=\"inactive\",name=\"db1\",team=\"core\"} 3\n",
            "# HELP qe_total_scrapes Current total scrapes.\n",
            "# TYPE qe_total_scrapes counter\n",
            "qe_total_scrapes{driver=\"redis\"} 7\n",
        );
        assert_eq!(render(&samples), expected);
    }

    #[test]
    fn test_render_special_values_and_duplicates() {
        let desc = Arc::new(Desc::new("g", "", ["k"], &BTreeMap::new(), MetricKind::Gauge));
        let samples = vec![
            sample(&desc, f64::INFINITY, &["a"]),
            sample(&desc, f64::NEG_INFINITY, &["b"]),
            sample(&desc, 1.0, &["b"]),
            sample(&desc, 0.0, &[""]),
        ];

        let expected = "# TYPE g gauge\ng{k=\"\"} 0\ng{k=\"a\"} +Inf\ng{k=\"b\"} -Inf\n";
        assert_eq!(render(&samples), expected);
        assert_eq!(render(&Vec::<Sample>::new()), "");
    }

    #[test]
    fn test_render_keeps_series_with_distinct_const_labels() {
        let team = |value: &str| {
            let mut consts = BTreeMap::new();
            consts.insert("team".to_owned(), value.to_owned());
            Arc::new(Desc::new("g", "", ["k"], &consts, MetricKind::Gauge))
        };
        let (ops, core) = (team("ops"), team("core"));
        let samples = vec![sample(&ops, 2.0, &["a"]), sample(&core, 1.0, &["a"])];

        let expected = "# TYPE g gauge\ng{k=\"a\",team=\"core\"} 1\ng{k=\"a\",team=\"ops\"} 2\n";
        assert_eq!(render(&samples), expected);
    }

    #[test]
    fn test_sanitize_metric_name_known_cases() {
        let cases = &[
            ("*", "_"),
            ("\"", "_"),
            ("foo_bar", "foo_bar"),
            ("foo1_bar", "foo1_bar"),
            ("1foobar", "_foobar"),
            ("foo1:bar2", "foo1:bar2"),
            ("123", "_23"),
        ];

        for (input, expected) in cases {
            let result = sanitize_metric_name(input);
            assert_eq!(expected, &result);
        }
    }

    #[test]
    fn test_sanitize_label_key_known_cases() {
        let cases = &[
            ("*", "_"),
            ("\"", "_"),
            (":", "_"),
            ("foo_bar", "foo_bar"),
            ("1foobar", "_foobar"),
            ("__foobar", "__foobar"),
            ("foo1bar2", "foo1bar2"),
            ("123", "_23"),
        ];

        for (input, expected) in cases {
            let result = sanitize_label_key(input);
            assert_eq!(expected, &result);
        }
    }

    #[test]
    fn test_sanitize_label_value_known_cases() {
        let cases = &[
            ("*", "*"),
            ("\"", "\\\""),
            ("\\", "\\\\"),
            ("\\\\", "\\\\"),
            ("\n", "\\n"),
            ("foo_bar", "foo_bar"),
            ("1foobar", "1foobar"),
        ];

        for (input, expected) in cases {
            let result = sanitize_label_value(input);
            assert_eq!(expected, &result);
        }
    }

    #[test]
    fn test_sanitize_description_known_cases() {
        let cases = &[
            ("*", "*"),
            ("\"", "\""),
            ("\\", "\\\\"),
            ("\\\\", "\\\\"),
            ("\n", "\\n"),
            ("foo_bar", "foo_bar"),
            ("1foobar", "1foobar"),
        ];

        for (input, expected) in cases {
            let result = sanitize_description(input);
            assert_eq!(expected, &result);
        }
    }

    proptest! {
        #[test]
        fn test_sanitize_metric_name(input in "[\n\"\\\\]?.*[\n\"\\\\]?") {
            let result = sanitize_metric_name(&input);
            let as_chars = result.chars().collect::<Vec<_>>();

            if let Some(c) = as_chars.first() {
                assert!(valid_metric_name_start_character(*c),
                    "first character of metric name was not valid");
            }

            assert!(as_chars.iter().all(|c| valid_metric_name_character(*c)),
                "invalid character in metric name");
        }

        #[test]
        fn test_sanitize_label_key(input in "[\n\"\\\\:]?.*[\n\"\\\\:]?") {
            let result = sanitize_label_key(&input);
            let as_chars = result.chars().collect::<Vec<_>>();

            if let Some(c) = as_chars.first() {
                assert!(valid_label_key_start_character(*c),
                    "first character of label key was not valid");
            }

            // Label keys cannot begin with two underscores, as that format is reserved for internal
            // use.
            //
            // TODO: More closely examine how official Prometheus client libraries handle label key sanitization
            // and follow whatever they do, so it's not actually clear if transforming `__foo` to `___foo` would
            // be valid, given that it still technically starts with two underscores.
            /*if as_chars.len() == 2 {
                assert!(!(as_chars[0] == '_' && as_chars[1] == '_'));
            } else if as_chars.len() == 3 {
                if as_chars[0] == '_' && as_chars[1] == '_' {
                    assert_eq!(as_chars[2], '_');
                }
            }*/

            assert!(as_chars.iter().all(|c| valid_label_key_character(*c)),
                "invalid character in label key");
        }

        #[test]
        fn test_sanitize_label_value(input in "[\n\"\\\\]?.*[\n\"\\\\]?") {
            let result = sanitize_label_value(&input);

            // If any raw newlines are still present, then we messed up.
            assert!(!result.contains('\n'), "raw/unescaped newlines present");

            // We specifically remove instances of "\\" because we only care about dangling backslashes.
            let delayered_backslashes = result.replace("\\\\", "");
            let as_chars = delayered_backslashes.chars().collect::<Vec<_>>();

            // If the first character is a double quote, then we messed up.
            assert!(as_chars.first().map_or(true, |c| *c != '"'),
                "first character cannot be a double quote: {}", result);

            // Now look for unescaped characters in the rest of the string, in a windowed fashion.
            let contained_unescaped_chars = as_chars.as_slice()
                .windows(2)
                .any(|s| {
                    let first = s[0];
                    let second = s[1];

                    match (first, second) {
                        // If there's a double quote, it has to have been preceded by an escaping
                        // backslash.
                        (c, '"') => c != '\\',
                        // If there's a backslash, it can only be in front of an 'n' for escaping
                        // newlines.
                        ('\\', c) => c != 'n',
                        // Everything else is valid.
                        _ => false,
                    }
                });
            assert!(!contained_unescaped_chars, "invalid or missing escape detected");
        }

        #[test]
        fn test_sanitize_description(input in "[\n\"\\\\]?.*[\n\"\\\\]?") {
            let result = sanitize_description(&input);

            // If any raw newlines are still present, then we messed up.
            assert!(!result.contains('\n'), "raw/unescaped newlines present");

            // We specifically remove instances of "\\" because we only care about dangling backslashes.
            let delayered_backslashes = result.replace("\\\\", "");
            let as_chars = delayered_backslashes.chars().collect::<Vec<_>>();

            // Now look for unescaped characters in the rest of the string, in a windowed fashion.
            let contained_unescaped_chars = as_chars.as_slice()
                .windows(2)
                .any(|s| {
                    let first = s[0];
                    let second = s[1];

                    match (first, second) {
                        // If there's a backslash, it can only be in front of an 'n' for escaping
                        // newlines.
                        ('\\', c) => c != 'n',
                        // Everything else is valid.
                        _ => false,
                    }
                });
            assert!(!contained_unescaped_chars, "invalid or missing escape detected");
        }
    }
}
