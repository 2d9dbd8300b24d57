use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pdbsim_core::config::{PhasePorts, ServiceConfig};
use reqwest::Url;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::api::{JobId, Phase, PhaseProgress, PhaseResult, PhaseStatistics};
use crate::store::StructureStore;

/// Failures of a single backend call. None of them is retried here.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The request could not be completed at the network level.
    #[error("search backend not responding ({url}): {message}")]
    Unreachable {
        /// Requested URL.
        url: String,
        /// Transport error description.
        message: String,
    },
    /// The body is not the expected JSON envelope.
    #[error("search backend returned an incorrect response: {0}")]
    MalformedResponse(#[source] serde_json::Error),
    /// The envelope carries a status code outside the accepted set.
    #[error("search backend signalled error (status code {code})")]
    Status {
        /// Envelope status code.
        code: i64,
    },
    /// A required field is missing from the envelope.
    #[error("search backend returned an unexpected response (missing `{0}`)")]
    UnexpectedShape(String),
    /// Backend ids could not be mapped to chain identifiers.
    #[error("failed to resolve candidate ids: {0:#}")]
    Resolve(anyhow::Error),
}

/// Remote approximate-nearest-neighbour search service.
#[async_trait]
pub trait SearchBackend: Send + Sync {
    /// Run one search phase for `query` and return its candidates in rank order.
    async fn run_phase(
        &self,
        query: &str,
        radius: f64,
        num_results: u32,
        phase: Phase,
        job_id: &JobId,
    ) -> Result<PhaseResult, BackendError>;

    /// Progress of a running phase.
    async fn get_progress(
        &self,
        job_id: &JobId,
        phase: Phase,
    ) -> Result<PhaseProgress, BackendError>;

    /// Ask the backend to stop working on `job_id` (best-effort).
    async fn end_job(&self, job_id: &JobId, phase: Phase) -> Result<(), BackendError>;
}

const ACCEPTED_STATUS_CODES: [i64; 2] = [200, 201];

/// Connection settings of [`HttpBackend`].
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Backend host; the port is replaced per phase.
    pub base_url: Url,
    /// Service port of each phase.
    pub ports: PhasePorts,
    /// Whole-request timeout (phase searches can be slow).
    pub timeout: Duration,
}

impl BackendConfig {
    /// Default whole-request timeout.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

    /// Settings taken from the service configuration file.
    pub fn from_service(cfg: &ServiceConfig) -> anyhow::Result<Self> {
        Ok(Self {
            base_url: Url::parse(&cfg.backend_url)?,
            ports: cfg.ports.clone(),
            timeout: Self::DEFAULT_TIMEOUT,
        })
    }

    fn port(&self, phase: Phase) -> u16 {
        match phase {
            Phase::SketchCoarse => self.ports.sketches_small,
            Phase::SketchFine => self.ports.sketches_large,
            Phase::Exhaustive => self.ports.full,
        }
    }

    fn endpoint(&self, phase: Phase, path: &str) -> Result<Url, BackendError> {
        let mut url = self.base_url.clone();
        url.set_port(Some(self.port(phase)))
            .map_err(|()| BackendError::Unreachable {
                url: self.base_url.to_string(),
                message: "backend URL cannot carry a port".to_string(),
            })?;
        url.join(path).map_err(|err| BackendError::Unreachable {
            url: url.to_string(),
            message: format!("invalid endpoint: {err}"),
        })
    }

    pub(crate) fn search_url(
        &self,
        query: &str,
        radius: f64,
        num_results: u32,
        phase: Phase,
        job_id: &JobId,
    ) -> Result<Url, BackendError> {
        let mut url = self.endpoint(phase, "search")?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs
                .append_pair("queryid", query)
                .append_pair("k", &num_results.to_string())
                .append_pair("job_id", job_id.as_str());
            if phase.uses_radius() {
                pairs.append_pair("radius", &radius.to_string());
            }
        }
        Ok(url)
    }

    fn job_url(&self, phase: Phase, path: &str, job_id: &JobId) -> Result<Url, BackendError> {
        let mut url = self.endpoint(phase, path)?;
        url.query_pairs_mut().append_pair("job_id", job_id.as_str());
        Ok(url)
    }
}

/// [`SearchBackend`] speaking the backend's HTTP/JSON protocol.
pub struct HttpBackend {
    http: reqwest::Client,
    cfg: BackendConfig,
    store: Arc<dyn StructureStore>,
}

impl HttpBackend {
    /// Client resolving candidate ids through `store`.
    pub fn new(cfg: BackendConfig, store: Arc<dyn StructureStore>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(cfg.timeout).build()?;
        Ok(Self { http, cfg, store })
    }

    async fn get(&self, url: Url) -> Result<Vec<u8>, BackendError> {
        let unreachable = |err: reqwest::Error| BackendError::Unreachable {
            url: url.to_string(),
            message: format!("{err:#}"),
        };
        let res = self.http.get(url.clone()).send().await.map_err(unreachable)?;
        let body = res.bytes().await.map_err(unreachable)?;
        Ok(body.to_vec())
    }
}

#[async_trait]
impl SearchBackend for HttpBackend {
    async fn run_phase(
        &self,
        query: &str,
        radius: f64,
        num_results: u32,
        phase: Phase,
        job_id: &JobId,
    ) -> Result<PhaseResult, BackendError> {
        let url = self
            .cfg
            .search_url(query, radius, num_results, phase, job_id)?;
        debug!(%job_id, %phase, %url, "running search phase");

        let body = self.get(url.clone()).await.inspect_err(|err| {
            warn!(%job_id, %phase, %url, "search backend call failed: {err}");
        })?;
        let (internal_ids, statistics) = parse_search_response(phase, &body).inspect_err(|err| {
            warn!(
                %job_id,
                %phase,
                %url,
                response = %String::from_utf8_lossy(&body),
                "search backend response rejected: {err}"
            );
        })?;

        if internal_ids.is_empty() {
            return Ok(PhaseResult {
                candidate_ids: Vec::new(),
                statistics,
            });
        }
        let candidate_ids = self
            .store
            .resolve_chain_ids(&internal_ids)
            .await
            .map_err(BackendError::Resolve)?;
        Ok(PhaseResult {
            candidate_ids,
            statistics,
        })
    }

    async fn get_progress(
        &self,
        job_id: &JobId,
        phase: Phase,
    ) -> Result<PhaseProgress, BackendError> {
        let url = self.cfg.job_url(phase, "get_progress", job_id)?;
        let body = self.get(url.clone()).await.inspect_err(|err| {
            warn!(%job_id, %phase, %url, "progress poll failed: {err}");
        })?;
        parse_progress(phase, &body).inspect_err(|err| {
            warn!(%job_id, %phase, %url, "progress response rejected: {err}");
        })
    }

    async fn end_job(&self, job_id: &JobId, phase: Phase) -> Result<(), BackendError> {
        let url = self.cfg.job_url(phase, "end_job", job_id)?;
        debug!(%job_id, %phase, %url, "ending backend search");
        self.get(url).await.map(|_| ())
    }
}

#[derive(Debug, Deserialize)]
struct EnvelopeStatus {
    code: i64,
}

#[derive(Debug, Deserialize)]
struct EnvelopeHead {
    status: EnvelopeStatus,
}

fn lookup<'a>(value: &'a Value, path: &[&str]) -> Result<&'a Value, BackendError> {
    let mut current = value;
    for key in path {
        current = current
            .get(*key)
            .ok_or_else(|| BackendError::UnexpectedShape(path.join(".")))?;
    }
    Ok(current)
}

fn number(value: &Value, path: &[&str]) -> Result<f64, BackendError> {
    lookup(value, path)?
        .as_f64()
        .ok_or_else(|| BackendError::UnexpectedShape(path.join(".")))
}

fn record_id(record: &Value) -> Option<u64> {
    match record.get("_id")? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Validate a search envelope and extract backend ids and statistics.
pub(crate) fn parse_search_response(
    phase: Phase,
    body: &[u8],
) -> Result<(Vec<u64>, PhaseStatistics), BackendError> {
    let value: Value = serde_json::from_slice(body).map_err(BackendError::MalformedResponse)?;
    let head: EnvelopeHead =
        serde_json::from_value(value.clone()).map_err(BackendError::MalformedResponse)?;
    if !ACCEPTED_STATUS_CODES.contains(&head.status.code) {
        return Err(BackendError::Status {
            code: head.status.code,
        });
    }

    let records = lookup(&value, &["answer_records"])?
        .as_array()
        .ok_or_else(|| BackendError::UnexpectedShape("answer_records".to_string()))?;
    let ids = records
        .iter()
        .map(|record| {
            record_id(record)
                .ok_or_else(|| BackendError::UnexpectedShape("answer_records._id".to_string()))
        })
        .collect::<Result<Vec<u64>, BackendError>>()?;

    let pivot_time = number(&value, &["query_record", "pivotDistTimes"])?;
    let operation_time = number(&value, &["statistics", "OperationTime"])?;
    let mut statistics = PhaseStatistics {
        pivot_dist_count_total: number(&value, &["query_record", "pivotDistCountTotal"])?,
        pivot_dist_count_cached: number(&value, &["query_record", "pivotDistCountCached"])?,
        pivot_time,
        search_dist_count_total: 0.0,
        search_dist_count_cached: 0.0,
        search_time: operation_time,
    };
    if phase == Phase::Exhaustive {
        statistics.search_dist_count_total =
            number(&value, &["query_record", "searchDistCountTotal"])?;
        statistics.search_dist_count_cached =
            number(&value, &["query_record", "searchDistCountCached"])?;
        statistics.search_time = operation_time - pivot_time;
    }

    Ok((ids, statistics))
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|x| x != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
        Value::Null => false,
    }
}

/// Validate a progress envelope.
pub(crate) fn parse_progress(phase: Phase, body: &[u8]) -> Result<PhaseProgress, BackendError> {
    let value: Value = serde_json::from_slice(body).map_err(BackendError::MalformedResponse)?;

    let mut progress = PhaseProgress::default();
    if !truthy(lookup(&value, &["Running"])?) {
        return Ok(progress);
    }

    let pivot_cached = number(&value, &["pivotDistCountCached"])?;
    progress.running = true;
    progress.pivot_dist_count_expected = Some(number(&value, &["pivotDistCountExpected"])?);
    progress.pivot_dist_count_cached = Some(pivot_cached);
    progress.pivot_dist_count_computed =
        Some((number(&value, &["pivotDistCountComputed"])? - pivot_cached).max(0.0));

    if phase == Phase::Exhaustive {
        let pivot_time = lookup(&value, &["pivotTime"])?;
        if !pivot_time.is_null() {
            let search_cached = number(&value, &["searchDistCountCached"])?;
            progress.pivot_time = Some(number(&value, &["pivotTime"])?);
            progress.search_dist_count_expected =
                Some(number(&value, &["searchDistCountExpected"])?);
            progress.search_dist_count_cached = Some(search_cached);
            progress.search_dist_count_computed =
                Some((number(&value, &["searchDistCountComputed"])? - search_cached).max(0.0));
        }
    }

    Ok(progress)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BackendConfig {
        BackendConfig {
            base_url: Url::parse("http://backend.test").unwrap(),
            ports: PhasePorts {
                sketches_small: 1001,
                sketches_large: 1002,
                full: 1003,
            },
            timeout: Duration::from_secs(5),
        }
    }

    const SKETCH_OK: &str = r#"{
        "status": {"code": 200},
        "answer_records": [{"_id": 7}, {"_id": "3"}],
        "query_record": {"pivotDistCountTotal": 64, "pivotDistCountCached": 60, "pivotDistTimes": 12},
        "statistics": {"OperationTime": 40}
    }"#;

    const FULL_OK: &str = r#"{
        "status": {"code": 201},
        "answer_records": [{"_id": 1}],
        "query_record": {"pivotDistCountTotal": 64, "pivotDistCountCached": 0, "pivotDistTimes": 15,
                         "searchDistCountTotal": 900, "searchDistCountCached": 100},
        "statistics": {"OperationTime": 515}
    }"#;

    #[test]
    fn coarse_phase_url_has_no_radius() {
        let url = config()
            .search_url("1ABC:A", 0.3, 5, Phase::SketchCoarse, &JobId::from("j1"))
            .unwrap();
        assert_eq!(url.port(), Some(1001));
        assert_eq!(url.path(), "/search");
        assert_eq!(url.query(), Some("queryid=1ABC%3AA&k=5&job_id=j1"));
    }

    #[test]
    fn later_phases_carry_radius() {
        let cfg = config();
        for (phase, port) in [(Phase::SketchFine, 1002), (Phase::Exhaustive, 1003)] {
            let url = cfg
                .search_url("1ABC:A", 0.3, 5, phase, &JobId::from("j1"))
                .unwrap();
            assert_eq!(url.port(), Some(port));
            assert!(url.query_pairs().any(|(k, v)| k == "radius" && v == "0.3"));
        }
    }

    #[test]
    fn sketch_statistics_report_zero_search_counts() {
        let (ids, stats) = parse_search_response(Phase::SketchFine, SKETCH_OK.as_bytes()).unwrap();
        assert_eq!(ids, vec![7, 3]);
        assert_eq!(stats.pivot_dist_count_total, 64.0);
        assert_eq!(stats.search_dist_count_total, 0.0);
        assert_eq!(stats.search_time, 40.0);
    }

    #[test]
    fn exhaustive_statistics_subtract_pivot_time() {
        let (ids, stats) = parse_search_response(Phase::Exhaustive, FULL_OK.as_bytes()).unwrap();
        assert_eq!(ids, vec![1]);
        assert_eq!(stats.search_dist_count_total, 900.0);
        assert_eq!(stats.search_dist_count_cached, 100.0);
        assert_eq!(stats.search_time, 500.0);
    }

    #[test]
    fn exhaustive_requires_distance_counts() {
        let err = parse_search_response(Phase::Exhaustive, SKETCH_OK.as_bytes()).unwrap_err();
        assert!(
            matches!(&err, BackendError::UnexpectedShape(field) if field == "query_record.searchDistCountTotal"),
            "{err}"
        );
    }

    #[test]
    fn envelope_error_code_is_rejected() {
        let body = br#"{"status": {"code": 500, "message": "boom"}}"#;
        let err = parse_search_response(Phase::SketchCoarse, body).unwrap_err();
        assert!(matches!(err, BackendError::Status { code: 500 }));
        assert_eq!(err.to_string(), "search backend signalled error (status code 500)");
    }

    #[test]
    fn non_json_body_is_malformed() {
        let err = parse_search_response(Phase::SketchCoarse, b"<html>502</html>").unwrap_err();
        assert!(matches!(err, BackendError::MalformedResponse(_)));
        let err = parse_search_response(Phase::SketchCoarse, br#"{"answer_records": []}"#).unwrap_err();
        assert!(matches!(err, BackendError::MalformedResponse(_)));
    }

    #[test]
    fn missing_statistics_is_unexpected_shape() {
        let body = br#"{"status": {"code": 200}, "answer_records": []}"#;
        let err = parse_search_response(Phase::SketchCoarse, body).unwrap_err();
        assert!(matches!(err, BackendError::UnexpectedShape(_)));
    }

    #[test]
    fn idle_progress_reports_not_running() {
        let progress = parse_progress(Phase::SketchCoarse, br#"{"Running": 0}"#).unwrap();
        assert_eq!(progress, PhaseProgress::default());
    }

    #[test]
    fn progress_subtracts_cached_distances() {
        let body = br#"{"Running": true, "pivotDistCountExpected": 64, "pivotDistCountCached": 10,
            "pivotDistCountComputed": 5, "pivotTime": 30, "searchDistCountExpected": 1000,
            "searchDistCountCached": 100, "searchDistCountComputed": 400}"#;

        let sketch = parse_progress(Phase::SketchFine, body).unwrap();
        assert!(sketch.running);
        assert_eq!(sketch.pivot_dist_count_computed, Some(0.0));
        assert_eq!(sketch.search_dist_count_expected, None);

        let full = parse_progress(Phase::Exhaustive, body).unwrap();
        assert_eq!(full.pivot_time, Some(30.0));
        assert_eq!(full.search_dist_count_computed, Some(300.0));
    }

    #[test]
    fn exhaustive_progress_before_pivots_finish() {
        let body = br#"{"Running": true, "pivotDistCountExpected": 64, "pivotDistCountCached": 0,
            "pivotDistCountComputed": 20, "pivotTime": null}"#;
        let full = parse_progress(Phase::Exhaustive, body).unwrap();
        assert_eq!(full.pivot_dist_count_computed, Some(20.0));
        assert_eq!(full.pivot_time, None);
    }
}
