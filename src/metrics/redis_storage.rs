//! Redis-backed metric storage.
//!
//! Every process pointed at the same database writes into shared hashes, and
//! any of them can render the combined series. Layout under the key prefix:
//! `names` is a set of metric names, `meta:<name>` holds type and help, and
//! `series:<name>` maps an encoded label set to its value.

use crate::config::RedisConfig;
use crate::error::{ObservatoryError, Result};
use crate::metrics::storage::MetricStorage;
use crate::metrics::MetricType;
use redis::{Client, Connection, Pipeline, RedisResult};
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write;
use std::sync::{Mutex, MutexGuard};
use tracing::warn;

const SUM: &str = "sum";
const COUNT: &str = "count";
const PART_SEPARATOR: char = '\u{1f}';

pub struct RedisStorage {
    connection: Mutex<Connection>,
    prefix: String,
    buckets: Vec<f64>,
}

impl RedisStorage {
    /// Connect and select the configured database. Fails when the server is
    /// unreachable or rejects the credentials.
    pub fn connect(config: &RedisConfig, buckets: &[f64]) -> Result<Self> {
        if buckets.is_empty() {
            return Err(ObservatoryError::Storage("histogram buckets must not be empty".into()));
        }

        let url = config.url()?;
        let client = Client::open(url.as_str()).map_err(storage_error)?;
        let timeout = config.timeout();
        let connection = client.get_connection_with_timeout(timeout).map_err(storage_error)?;
        connection.set_read_timeout(Some(timeout)).map_err(storage_error)?;
        connection.set_write_timeout(Some(timeout)).map_err(storage_error)?;

        Ok(Self { connection: Mutex::new(connection), prefix: config.prefix.clone(), buckets: buckets.to_vec() })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        match self.connection.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn key(&self, parts: &[&str]) -> String {
        let mut key = self.prefix.clone();
        for part in parts {
            key.push(':');
            key.push_str(part);
        }
        key
    }

    fn run(&self, pipe: &Pipeline) {
        let mut connection = self.lock();
        if let Err(e) = pipe.query::<()>(&mut *connection) {
            warn!("Redis metric write failed: {}", e);
        }
    }

    fn collect(&self) -> RedisResult<String> {
        let mut connection = self.lock();
        let mut names: Vec<String> = redis::cmd("SMEMBERS").arg(self.key(&["names"])).query(&mut *connection)?;
        names.sort();

        let mut out = String::new();
        for name in names {
            let meta: HashMap<String, String> =
                redis::cmd("HGETALL").arg(self.key(&["meta", &name])).query(&mut *connection)?;
            let series: HashMap<String, String> =
                redis::cmd("HGETALL").arg(self.key(&["series", &name])).query(&mut *connection)?;
            if series.is_empty() {
                continue;
            }
            let family = Family {
                name: &name,
                metric_type: meta.get("type").map(String::as_str).unwrap_or("untyped"),
                help: meta.get("help").map(String::as_str).unwrap_or(""),
            };
            family.render(&mut out, &series, &self.buckets);
        }
        Ok(out)
    }
}

impl MetricStorage for RedisStorage {
    fn describe(&self, name: &str, metric_type: MetricType, help: &str) {
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("SADD")
            .arg(self.key(&["names"]))
            .arg(name)
            .ignore()
            .cmd("HSET")
            .arg(self.key(&["meta", name]))
            .arg("type")
            .arg(type_name(metric_type))
            .arg("help")
            .arg(help)
            .ignore();
        self.run(&pipe);
    }

    fn increment_counter(&self, name: &str, labels: &[(String, String)], value: u64) {
        let mut pipe = redis::pipe();
        pipe.cmd("HINCRBY")
            .arg(self.key(&["series", name]))
            .arg(encode_labels(labels))
            .arg(value)
            .ignore();
        self.run(&pipe);
    }

    fn set_gauge(&self, name: &str, labels: &[(String, String)], value: f64) {
        let mut pipe = redis::pipe();
        pipe.cmd("HSET")
            .arg(self.key(&["series", name]))
            .arg(encode_labels(labels))
            .arg(value)
            .ignore();
        self.run(&pipe);
    }

    fn observe_histogram(&self, name: &str, labels: &[(String, String)], value: f64) {
        let key = self.key(&["series", name]);
        let labels = encode_labels(labels);

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.cmd("HINCRBYFLOAT").arg(&key).arg(field(&labels, SUM)).arg(value).ignore();
        pipe.cmd("HINCRBY").arg(&key).arg(field(&labels, COUNT)).arg(1).ignore();
        for bucket in self.buckets.iter().filter(|b| value <= **b) {
            pipe.cmd("HINCRBY").arg(&key).arg(field(&labels, &bucket.to_string())).arg(1).ignore();
        }
        self.run(&pipe);
    }

    fn render(&self) -> String {
        match self.collect() {
            Ok(text) => text,
            Err(e) => {
                warn!("Redis metric read failed: {}", e);
                String::new()
            }
        }
    }
}

fn storage_error(e: redis::RedisError) -> ObservatoryError {
    ObservatoryError::Storage(e.to_string())
}

fn type_name(metric_type: MetricType) -> &'static str {
    match metric_type {
        MetricType::Counter => "counter",
        MetricType::Gauge => "gauge",
        MetricType::Histogram => "histogram",
    }
}

fn encode_labels(labels: &[(String, String)]) -> String {
    serde_json::to_string(labels).unwrap_or_else(|_| "[]".to_string())
}

fn decode_labels(encoded: &str) -> Vec<(String, String)> {
    serde_json::from_str(encoded).unwrap_or_default()
}

fn field(labels: &str, part: &str) -> String {
    format!("{}{}{}", labels, PART_SEPARATOR, part)
}

/// One metric family as stored: name, type and help text.
struct Family<'a> {
    name: &'a str,
    metric_type: &'a str,
    help: &'a str,
}

impl Family<'_> {
    fn render(&self, out: &mut String, series: &HashMap<String, String>, buckets: &[f64]) {
        if !self.help.is_empty() {
            let _ = writeln!(out, "# HELP {} {}", self.name, escape_help(self.help));
        }
        let _ = writeln!(out, "# TYPE {} {}", self.name, self.metric_type);

        if self.metric_type != "histogram" {
            let ordered: BTreeMap<&String, &String> = series.iter().collect();
            for (labels, value) in ordered {
                let _ = writeln!(out, "{}{} {}", self.name, format_labels(&decode_labels(labels), None), value);
            }
            out.push('\n');
            return;
        }

        let mut grouped: BTreeMap<&str, HashMap<&str, &str>> = BTreeMap::new();
        for (field, value) in series {
            if let Some((labels, part)) = field.rsplit_once(PART_SEPARATOR) {
                grouped.entry(labels).or_default().insert(part, value);
            }
        }

        for (labels, parts) in grouped {
            let labels = decode_labels(labels);
            let count = parts.get(COUNT).copied().unwrap_or("0");
            for bucket in buckets {
                let le = bucket.to_string();
                let value = parts.get(le.as_str()).copied().unwrap_or("0");
                let _ = writeln!(out, "{}_bucket{} {}", self.name, format_labels(&labels, Some(&le)), value);
            }
            let _ = writeln!(out, "{}_bucket{} {}", self.name, format_labels(&labels, Some("+Inf")), count);
            let plain = format_labels(&labels, None);
            let _ = writeln!(out, "{}_sum{} {}", self.name, plain, parts.get(SUM).copied().unwrap_or("0"));
            let _ = writeln!(out, "{}_count{} {}", self.name, plain, count);
        }
        out.push('\n');
    }
}

fn format_labels(labels: &[(String, String)], le: Option<&str>) -> String {
    let mut pairs: Vec<String> = labels
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", k, escape_label(v)))
        .collect();
    if let Some(le) = le {
        pairs.push(format!("le=\"{}\"", le));
    }
    if pairs.is_empty() {
        String::new()
    } else {
        format!("{{{}}}", pairs.join(","))
    }
}

fn escape_label(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', "\\n")
}

fn escape_help(help: &str) -> String {
    help.replace('\\', "\\\\").replace('\n', "\\n")
}
