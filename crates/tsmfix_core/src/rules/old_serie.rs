//! Reports series whose newest point is older than a cutoff.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Write};

use chrono::{DateTime, SecondsFormat};

use crate::error::{CoreError, CoreResult};
use crate::filter::config::{take_bool, take_str};
use crate::logging::{LogBuffer, ScopedLogger};
use crate::rules::{Rule, RuleConfig, TSM_READ};
use tsmfix_codec::{key, Value};

/// Output format of the report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportFormat {
    /// One key per line, optionally `key: timestamp`.
    Text,
    /// One JSON object per line with `Serie` and optional `Timestamp`.
    Json,
}

impl ReportFormat {
    fn parse(text: &str) -> CoreResult<Self> {
        match text {
            "text" => Ok(ReportFormat::Text),
            "json" => Ok(ReportFormat::Json),
            other => Err(CoreError::invalid_value(
                "format",
                format!("unknown format '{other}'"),
            )),
        }
    }
}

struct Formatter {
    format: ReportFormat,
    with_timestamp: bool,
    timestamp_layout: String,
}

impl Formatter {
    fn format_timestamp(&self, unix_nanos: i64) -> String {
        if self.timestamp_layout.is_empty() {
            return unix_nanos.to_string();
        }

        let ts = DateTime::from_timestamp_nanos(unix_nanos);
        if self.timestamp_layout.eq_ignore_ascii_case("RFC3339") {
            return ts.to_rfc3339_opts(SecondsFormat::Secs, true);
        }
        ts.format(&self.timestamp_layout).to_string()
    }

    fn write_line(&self, out: &mut dyn Write, serie: &str, timestamp: i64) -> io::Result<()> {
        match self.format {
            ReportFormat::Text => {
                if self.with_timestamp {
                    writeln!(out, "{serie}: {}", self.format_timestamp(timestamp))
                } else {
                    writeln!(out, "{serie}")
                }
            }
            ReportFormat::Json => {
                let mut line = serde_json::json!({ "Serie": serie });
                if self.with_timestamp {
                    line["Timestamp"] =
                        serde_json::Value::String(self.format_timestamp(timestamp));
                }
                writeln!(out, "{line}")
            }
        }
    }
}

/// Read-only rule accumulating the newest timestamp per series (or per
/// composite key when `by_field` is set) and emitting those at or below
/// the cutoff when the run ends.
pub struct OldSerieRule {
    cutoff_nanos: i64,
    by_field: bool,

    series: BTreeMap<String, i64>,
    formatter: Formatter,
    out: Box<dyn Write>,
    logger: ScopedLogger,
}

impl OldSerieRule {
    fn make_key(&self, composite: &[u8]) -> String {
        if self.by_field {
            String::from_utf8_lossy(composite).into_owned()
        } else {
            let (series_key, _) = key::series_and_field(composite);
            String::from_utf8_lossy(series_key).into_owned()
        }
    }

}

impl Rule for OldSerieRule {
    fn name(&self) -> &'static str {
        "old-serie"
    }

    fn check_mode(&mut self, _check: bool) {}

    fn flags(&self) -> u32 {
        TSM_READ
    }

    fn filter_key(&self, _key: &[u8]) -> bool {
        true
    }

    fn end(&mut self) {
        let mut count = 0usize;
        for (serie, &max_ts) in &self.series {
            if max_ts <= self.cutoff_nanos {
                if let Err(e) = self.formatter.write_line(&mut self.out, serie, max_ts) {
                    tracing::warn!("failed to write old-serie report line: {e}");
                }
                count += 1;
            }
        }
        let _ = self.out.flush();
        self.logger
            .record(format!("detected {count}/{} series as old", self.series.len()));
    }

    fn apply(
        &mut self,
        composite: &[u8],
        values: Vec<Value>,
    ) -> CoreResult<Option<(Vec<u8>, Vec<Value>)>> {
        if let Some(last) = values.last() {
            let max_ts = last.unix_nanos();
            let serie = self.make_key(composite);
            self.series
                .entry(serie)
                .and_modify(|ts| *ts = (*ts).max(max_ts))
                .or_insert(max_ts);
        }

        Ok(None)
    }
}

/// TOML configuration for [`OldSerieRule`].
#[derive(Default)]
pub struct OldSerieRuleConfig {
    /// RFC3339 cutoff; series with no point after it are reported.
    pub time: String,
    /// Report per composite key instead of per series key.
    pub by_field: bool,
    /// Output sink: `stdout` (default), `stderr`, or a file path.
    pub out: String,
    /// Report format: `text` (default) or `json`.
    pub format: String,
    /// Include the newest timestamp in the report.
    pub timestamp: bool,
    /// Timestamp layout; `RFC3339` is recognized, otherwise a strftime
    /// string. Empty prints raw nanoseconds.
    pub timestamp_layout: String,
}

impl RuleConfig for OldSerieRuleConfig {
    fn sample(&self) -> &'static str {
        r#"
        time = "2020-01-01T00:08:00Z"
        out = "stdout"
        #out = "out_file.log"
        format = "text"
        #format = "json"
        timestamp = true
"#
    }

    fn unmarshal(&mut self, table: &mut toml::Table) -> CoreResult<()> {
        if let Some(time) = take_str(table, "time")? {
            self.time = time;
        }
        if let Some(by_field) = take_bool(table, "byField")? {
            self.by_field = by_field;
        }
        if let Some(out) = take_str(table, "out")? {
            self.out = out;
        }
        if let Some(format) = take_str(table, "format")? {
            self.format = format;
        }
        if let Some(timestamp) = take_bool(table, "timestamp")? {
            self.timestamp = timestamp;
        }
        if let Some(layout) = take_str(table, "timestampLayout")? {
            self.timestamp_layout = layout;
        }
        Ok(())
    }

    fn build(&self, log: &LogBuffer) -> CoreResult<Box<dyn Rule>> {
        let cutoff = DateTime::parse_from_rfc3339(&self.time).map_err(|e| {
            CoreError::invalid_value("time", format!("invalid RFC3339 time '{}': {e}", self.time))
        })?;
        let cutoff_nanos = cutoff.timestamp_nanos_opt().ok_or_else(|| {
            CoreError::invalid_value("time", "cutoff out of nanosecond range")
        })?;

        let out: Box<dyn Write> = match self.out.as_str() {
            "" | "stdout" => Box::new(io::stdout()),
            "stderr" => Box::new(io::stderr()),
            path => Box::new(File::create(path)?),
        };

        let format = if self.format.is_empty() {
            ReportFormat::Text
        } else {
            ReportFormat::parse(&self.format)?
        };

        Ok(Box::new(OldSerieRule {
            cutoff_nanos,
            by_field: self.by_field,
            series: BTreeMap::new(),
            formatter: Formatter {
                format,
                with_timestamp: self.timestamp,
                timestamp_layout: self.timestamp_layout.clone(),
            },
            out,
            logger: log.scoped("old-serie"),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::tests_support::composite;

    fn build(config: OldSerieRuleConfig, path: &std::path::Path) -> Box<dyn Rule> {
        let config = OldSerieRuleConfig {
            out: path.to_string_lossy().into_owned(),
            ..config
        };
        config.build(&LogBuffer::new()).unwrap()
    }

    fn floats(points: &[i64]) -> Vec<Value> {
        points.iter().map(|&ts| Value::Float(ts, 1.0)).collect()
    }

    const NANOS_2019: i64 = 1_546_300_800_000_000_000; // 2019-01-01
    const NANOS_2021: i64 = 1_609_459_200_000_000_000; // 2021-01-01

    #[test]
    fn reports_only_stale_series_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("report.txt");
        let mut rule = build(
            OldSerieRuleConfig {
                time: "2020-01-01T00:00:00Z".to_string(),
                ..Default::default()
            },
            &out,
        );

        // cpu entirely in 2019, disk in 2021, mem mixed.
        assert!(rule
            .apply(
                &composite("cpu", &[("host", "h1")], "idle"),
                floats(&[NANOS_2019])
            )
            .unwrap()
            .is_none());
        rule.apply(
            &composite("disk", &[("host", "h1")], "usage"),
            floats(&[NANOS_2021]),
        )
        .unwrap();
        rule.apply(
            &composite("mem", &[("host", "h1")], "available"),
            floats(&[NANOS_2019, NANOS_2021]),
        )
        .unwrap();
        rule.end();

        let report = std::fs::read_to_string(&out).unwrap();
        assert_eq!(report, "cpu,host=h1\n");
    }

    #[test]
    fn by_field_keeps_the_field_component() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("report.txt");
        let mut rule = build(
            OldSerieRuleConfig {
                time: "2020-01-01T00:00:00Z".to_string(),
                by_field: true,
                ..Default::default()
            },
            &out,
        );

        rule.apply(&composite("cpu", &[], "idle"), floats(&[NANOS_2019]))
            .unwrap();
        rule.end();

        let report = std::fs::read_to_string(&out).unwrap();
        assert_eq!(report, "cpu#!~#idle\n");
    }

    #[test]
    fn json_format_with_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("report.json");
        let mut rule = build(
            OldSerieRuleConfig {
                time: "2020-01-01T00:00:00Z".to_string(),
                format: "json".to_string(),
                timestamp: true,
                timestamp_layout: "RFC3339".to_string(),
                ..Default::default()
            },
            &out,
        );

        rule.apply(&composite("cpu", &[], "idle"), floats(&[NANOS_2019]))
            .unwrap();
        rule.end();

        let report = std::fs::read_to_string(&out).unwrap();
        let line: serde_json::Value = serde_json::from_str(report.trim()).unwrap();
        assert_eq!(line["Serie"], "cpu");
        assert_eq!(line["Timestamp"], "2019-01-01T00:00:00Z");
    }

    #[test]
    fn newest_timestamp_wins_across_segments() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("report.txt");
        let mut rule = build(
            OldSerieRuleConfig {
                time: "2020-01-01T00:00:00Z".to_string(),
                ..Default::default()
            },
            &out,
        );

        rule.apply(&composite("mem", &[], "used"), floats(&[NANOS_2019]))
            .unwrap();
        rule.apply(&composite("mem", &[], "free"), floats(&[NANOS_2021]))
            .unwrap();
        rule.end();

        // Same series key; the 2021 point rescues it.
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "");
    }

    #[test]
    fn invalid_time_fails_build() {
        let config = OldSerieRuleConfig {
            time: "not-a-time".to_string(),
            ..Default::default()
        };
        assert!(config.build(&LogBuffer::new()).is_err());
    }

    #[test]
    fn unknown_format_fails_build() {
        let config = OldSerieRuleConfig {
            time: "2020-01-01T00:00:00Z".to_string(),
            format: "xml".to_string(),
            ..Default::default()
        };
        assert!(config.build(&LogBuffer::new()).is_err());
    }
}
