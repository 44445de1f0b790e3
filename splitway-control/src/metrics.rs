//! Metric queries against a Prometheus-compatible API.

use std::future::Future;
use std::time::{Duration, SystemTime};

use serde::Deserialize;
use splitway_core::{MetricsSnapshot, RouteKey};
use tracing::trace;

use crate::error::MetricsError;

const MAX_ERROR_BODY: usize = 256;

/// Something that can evaluate an instant query to a single number.
pub trait MetricsSource: Send + Sync {
    /// Evaluate `expression`. `Ok(None)` means the query matched no series.
    fn query(
        &self,
        expression: &str,
    ) -> impl Future<Output = Result<Option<f64>, MetricsError>> + Send;
}

/// Query expressions for each reading, with `{route}` standing for the route path.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueryTemplates {
    /// Average latency in milliseconds.
    pub latency: String,
    /// Requests per second.
    pub request_rate: String,
    /// Error rate in percent.
    pub error_rate: String,
    /// CPU utilisation in percent.
    pub cpu: String,
    /// Memory utilisation in percent.
    pub memory: String,
}

impl Default for QueryTemplates {
    fn default() -> Self {
        Self {
            latency: concat!(
                "1000 * sum(rate(http_request_duration_seconds_sum{path=\"{route}\"}[5m]))",
                " / sum(rate(http_request_duration_seconds_count{path=\"{route}\"}[5m]))"
            )
            .to_string(),
            request_rate: "sum(rate(http_requests_total{path=\"{route}\"}[5m]))".to_string(),
            error_rate: concat!(
                "100 * sum(rate(http_requests_total{path=\"{route}\",status=~\"5..\"}[5m]))",
                " / sum(rate(http_requests_total{path=\"{route}\"}[5m]))"
            )
            .to_string(),
            cpu: concat!(
                "100 * sum(rate(container_cpu_usage_seconds_total{route=\"{route}\"}[5m]))",
                " / sum(container_spec_cpu_quota{route=\"{route}\"}",
                " / container_spec_cpu_period{route=\"{route}\"})"
            )
            .to_string(),
            memory: concat!(
                "100 * sum(container_memory_working_set_bytes{route=\"{route}\"})",
                " / sum(container_spec_memory_limit_bytes{route=\"{route}\"})"
            )
            .to_string(),
        }
    }
}

/// Substitute `route` into `template`, escaped for use inside a quoted label value.
pub fn render(template: &str, route: &RouteKey) -> String {
    let escaped = route.as_str().replace('\\', "\\\\").replace('"', "\\\"");
    template.replace("{route}", &escaped)
}

/// The readings collected for one route in one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RouteReadings {
    /// Average latency in milliseconds.
    pub latency: Option<f64>,
    /// Requests per second.
    pub request_rate: Option<f64>,
    /// Error rate in percent.
    pub error_rate: Option<f64>,
    /// CPU utilisation in percent.
    pub cpu: Option<f64>,
    /// Memory utilisation in percent.
    pub memory: Option<f64>,
}

impl RouteReadings {
    /// Whether no query returned anything.
    pub fn is_empty(&self) -> bool {
        [
            self.latency,
            self.request_rate,
            self.error_rate,
            self.cpu,
            self.memory,
        ]
        .iter()
        .all(Option::is_none)
    }

    /// Build a complete snapshot.
    ///
    /// Missing readings carry the previous snapshot's value forward, or zero when
    /// there is no previous snapshot.
    pub fn to_snapshot(&self, previous: Option<&MetricsSnapshot>) -> MetricsSnapshot {
        let carry = |reading: Option<f64>, field: fn(&MetricsSnapshot) -> f64| {
            reading.or_else(|| previous.map(field)).unwrap_or(0.0)
        };

        MetricsSnapshot {
            request_rate: carry(self.request_rate, |s| s.request_rate),
            avg_latency: carry(self.latency, |s| s.avg_latency),
            error_rate: carry(self.error_rate, |s| s.error_rate),
            cpu_utilization: carry(self.cpu, |s| s.cpu_utilization),
            memory_utilization: carry(self.memory, |s| s.memory_utilization),
            timestamp: SystemTime::now(),
        }
    }
}

/// Collect readings for `route`: latency only, or all five when `full` is set.
pub async fn collect<M: MetricsSource>(
    source: &M,
    templates: &QueryTemplates,
    route: &RouteKey,
    full: bool,
) -> Result<RouteReadings, MetricsError> {
    let latency_query = render(&templates.latency, route);
    if !full {
        let latency = source.query(&latency_query).await?;
        return Ok(RouteReadings {
            latency,
            ..RouteReadings::default()
        });
    }

    let request_query = render(&templates.request_rate, route);
    let error_query = render(&templates.error_rate, route);
    let cpu_query = render(&templates.cpu, route);
    let memory_query = render(&templates.memory, route);

    let (latency, request_rate, error_rate, cpu, memory) = tokio::try_join!(
        source.query(&latency_query),
        source.query(&request_query),
        source.query(&error_query),
        source.query(&cpu_query),
        source.query(&memory_query),
    )?;

    Ok(RouteReadings {
        latency,
        request_rate,
        error_rate,
        cpu,
        memory,
    })
}

/// [`MetricsSource`] backed by the Prometheus HTTP query API.
#[derive(Debug, Clone)]
pub struct PrometheusSource {
    client: reqwest::Client,
    query_url: String,
}

impl PrometheusSource {
    /// Query `endpoint`, giving up on any single request after `timeout`.
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, MetricsError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            query_url: format!("{}/api/v1/query", endpoint.trim_end_matches('/')),
        })
    }
}

impl MetricsSource for PrometheusSource {
    async fn query(&self, expression: &str) -> Result<Option<f64>, MetricsError> {
        trace!(query = expression, "querying metrics");
        let response = self
            .client
            .get(&self.query_url)
            .query(&[("query", expression)])
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if status.is_success() {
            return parse_query_response(&body);
        }

        match parse_query_response(&body) {
            Err(rejected @ MetricsError::Rejected(_)) => Err(rejected),
            _ => Err(MetricsError::Status {
                status: status.as_u16(),
                body: body.chars().take(MAX_ERROR_BODY).collect(),
            }),
        }
    }
}

#[derive(Deserialize)]
struct QueryResponse {
    status: String,
    #[serde(default)]
    data: Option<QueryData>,
    #[serde(default, rename = "errorType")]
    error_type: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
#[serde(tag = "resultType", content = "result", rename_all = "lowercase")]
enum QueryData {
    Vector(Vec<VectorSample>),
    Scalar(SamplePair),
    Matrix(serde_json::Value),
    String(serde_json::Value),
}

#[derive(Deserialize)]
struct VectorSample {
    value: SamplePair,
}

/// `[unix_timestamp, "value"]`
#[derive(Deserialize)]
struct SamplePair(#[allow(dead_code)] f64, String);

/// Interpret a query API response body.
///
/// An empty vector, or a value that is not a finite number, yields `Ok(None)`.
/// When a vector has several series the first one is used.
pub fn parse_query_response(body: &str) -> Result<Option<f64>, MetricsError> {
    let response: QueryResponse =
        serde_json::from_str(body).map_err(|e| MetricsError::Malformed(e.to_string()))?;

    if response.status != "success" {
        return Err(MetricsError::Rejected(format!(
            "{}: {}",
            response.error_type.as_deref().unwrap_or("error"),
            response.error.as_deref().unwrap_or("no details"),
        )));
    }

    let pair = match response.data {
        Some(QueryData::Vector(samples)) => match samples.into_iter().next() {
            Some(sample) => sample.value,
            None => return Ok(None),
        },
        Some(QueryData::Scalar(pair)) => pair,
        Some(QueryData::Matrix(_)) | Some(QueryData::String(_)) => {
            return Err(MetricsError::Malformed(
                "expected an instant vector or scalar".to_string(),
            ))
        }
        None => return Err(MetricsError::Malformed("missing data".to_string())),
    };

    let value: f64 = pair
        .1
        .parse()
        .map_err(|_| MetricsError::Malformed(format!("non-numeric sample value {:?}", pair.1)))?;
    Ok(value.is_finite().then_some(value))
}
