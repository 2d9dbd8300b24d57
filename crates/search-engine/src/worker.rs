use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

use crate::alignment::{Aligner, Alignment, AlignmentMatrix, RenderRequest, Visualizer};
use crate::api::{CandidateStat, JobId};
use crate::store::StructureStore;

#[derive(Debug, thiserror::Error)]
pub(crate) enum DetailError {
    #[error("structure store: {0:#}")]
    Store(anyhow::Error),
    #[error("alignment failed: {0:#}")]
    Computation(anyhow::Error),
    #[error("alignment task join error: {0}")]
    Join(String),
}

/// Collaborators shared by every candidate detail task.
pub(crate) struct DetailContext {
    pub(crate) store: Arc<dyn StructureStore>,
    pub(crate) aligner: Arc<dyn Aligner>,
    pub(crate) visualizer: Option<Arc<dyn Visualizer>>,
    pub(crate) cache_min_elapsed: Duration,
    pub(crate) computations_dir: PathBuf,
}

impl DetailContext {
    pub(crate) fn job_dir(&self, job_id: &JobId) -> PathBuf {
        self.computations_dir.join(format!("query{job_id}"))
    }
}

#[derive(Debug, Clone)]
pub(crate) struct DetailRequest {
    pub(crate) job_id: JobId,
    pub(crate) query: String,
    pub(crate) query_name: String,
    pub(crate) candidate: String,
    pub(crate) min_qscore: f64,
    pub(crate) disable_visualizations: bool,
}

/// Similarity statistics of one query/candidate pair.
pub(crate) async fn compute_stats(
    ctx: Arc<DetailContext>,
    req: DetailRequest,
) -> Result<CandidateStat, DetailError> {
    let alignment = similarity(&ctx, &req).await?;

    if alignment.qscore > req.min_qscore && !req.disable_visualizations {
        render_best_effort(&ctx, &req, alignment.matrix).await;
    }

    Ok(CandidateStat {
        qscore: alignment.qscore,
        rmsd: alignment.rmsd,
        seq_identity: alignment.seq_identity,
        aligned_length: alignment.aligned_length,
    })
}

async fn similarity(ctx: &DetailContext, req: &DetailRequest) -> Result<Alignment, DetailError> {
    if req.query == req.candidate {
        let aligned_length = match ctx
            .store
            .chain_length(&req.query)
            .await
            .map_err(DetailError::Store)?
        {
            Some(len) => len,
            None => {
                error!(query = %req.query, "query chain not found in store");
                0
            }
        };
        return Ok(Alignment {
            qscore: 1.0,
            rmsd: 0.0,
            seq_identity: 1.0,
            aligned_length,
            matrix: AlignmentMatrix::IDENTITY,
        });
    }

    if let Some(cached) = ctx
        .store
        .cached_alignment(&req.query, &req.candidate)
        .await
        .map_err(DetailError::Store)?
    {
        return Ok(cached);
    }

    let aligner = ctx.aligner.clone();
    let query = req.query.clone();
    let candidate = req.candidate.clone();
    let min_qscore = req.min_qscore;

    let started_at = Instant::now();
    let alignment =
        tokio::task::spawn_blocking(move || aligner.align(&query, &candidate, min_qscore))
            .await
            .map_err(|err| DetailError::Join(err.to_string()))?
            .map_err(DetailError::Computation)?;
    let elapsed = started_at.elapsed();

    if elapsed > ctx.cache_min_elapsed {
        match ctx
            .store
            .store_alignment(&req.query, &req.candidate, &alignment, elapsed)
            .await
        {
            Ok(()) => debug!(
                query = %req.query,
                candidate = %req.candidate,
                elapsed_ms = elapsed.as_millis() as u64,
                "cached alignment"
            ),
            Err(err) => warn!(
                query = %req.query,
                candidate = %req.candidate,
                "failed to cache alignment: {err:#}"
            ),
        }
    }

    Ok(alignment)
}

async fn render_best_effort(ctx: &DetailContext, req: &DetailRequest, matrix: AlignmentMatrix) {
    let Some(visualizer) = ctx.visualizer.clone() else {
        return;
    };
    let job_dir = ctx.job_dir(&req.job_id);
    let req_for_render = req.clone();

    let res = tokio::task::spawn_blocking(move || {
        visualizer.render(&RenderRequest {
            job_dir: &job_dir,
            query: &req_for_render.query,
            query_name: &req_for_render.query_name,
            other: &req_for_render.candidate,
            matrix: &matrix,
        })
    })
    .await;

    match res {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(
            job_id = %req.job_id,
            candidate = %req.candidate,
            "cannot generate alignment image: {err:#}"
        ),
        Err(err) => warn!(
            job_id = %req.job_id,
            candidate = %req.candidate,
            "alignment image task join error: {err}"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeAligner {
        calls: AtomicUsize,
        delay: Duration,
        qscore: f64,
        fail: bool,
    }

    impl FakeAligner {
        fn new(qscore: f64, delay: Duration) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                delay,
                qscore,
                fail: false,
            }
        }
    }

    impl Aligner for FakeAligner {
        fn align(&self, _query: &str, _other: &str, _min: f64) -> anyhow::Result<Alignment> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            if self.fail {
                anyhow::bail!("native routine crashed");
            }
            Ok(Alignment {
                qscore: self.qscore,
                rmsd: 1.5,
                seq_identity: 0.4,
                aligned_length: 87,
                matrix: AlignmentMatrix::IDENTITY,
            })
        }
    }

    struct FailingVisualizer {
        calls: AtomicUsize,
    }

    impl Visualizer for FailingVisualizer {
        fn render(&self, _request: &RenderRequest<'_>) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("pymol missing")
        }
    }

    fn context(
        store: Arc<MemoryStore>,
        aligner: Arc<FakeAligner>,
        visualizer: Option<Arc<FailingVisualizer>>,
    ) -> Arc<DetailContext> {
        Arc::new(DetailContext {
            store,
            aligner,
            visualizer: visualizer.map(|v| v as Arc<dyn Visualizer>),
            cache_min_elapsed: Duration::from_millis(30),
            computations_dir: std::env::temp_dir(),
        })
    }

    fn request(query: &str, candidate: &str) -> DetailRequest {
        DetailRequest {
            job_id: JobId::from("job"),
            query: query.to_string(),
            query_name: "query".to_string(),
            candidate: candidate.to_string(),
            min_qscore: 0.5,
            disable_visualizations: false,
        }
    }

    #[tokio::test]
    async fn self_comparison_skips_computation() {
        let store = Arc::new(MemoryStore::new());
        store.insert_chain(1, "1ABC:A", 129);
        let aligner = Arc::new(FakeAligner::new(0.2, Duration::ZERO));
        let ctx = context(store.clone(), aligner.clone(), None);

        let stat = compute_stats(ctx, request("1ABC:A", "1ABC:A")).await.unwrap();

        assert_eq!(stat.qscore, 1.0);
        assert_eq!(stat.rmsd, 0.0);
        assert_eq!(stat.seq_identity, 1.0);
        assert_eq!(stat.aligned_length, 129);
        assert_eq!(aligner.calls.load(Ordering::SeqCst), 0);
        assert_eq!(store.cached_len(), 0);
    }

    #[tokio::test]
    async fn self_comparison_of_unknown_chain_reports_zero_length() {
        let store = Arc::new(MemoryStore::new());
        let aligner = Arc::new(FakeAligner::new(0.2, Duration::ZERO));
        let ctx = context(store, aligner, None);

        let stat = compute_stats(ctx, request("9ZZZ:A", "9ZZZ:A")).await.unwrap();
        assert_eq!(stat.aligned_length, 0);
    }

    #[tokio::test]
    async fn slow_computation_is_cached_and_reused() {
        let store = Arc::new(MemoryStore::new());
        let aligner = Arc::new(FakeAligner::new(0.8, Duration::from_millis(60)));
        let ctx = context(store.clone(), aligner.clone(), None);

        let first = compute_stats(ctx.clone(), request("q", "c")).await.unwrap();
        let second = compute_stats(ctx, request("q", "c")).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(aligner.calls.load(Ordering::SeqCst), 1);
        assert!(store.cached_evaluation_ms("q", "c").unwrap() >= 30);
    }

    #[tokio::test]
    async fn fast_computation_is_not_cached() {
        let store = Arc::new(MemoryStore::new());
        let aligner = Arc::new(FakeAligner::new(0.8, Duration::ZERO));
        let ctx = context(store.clone(), aligner.clone(), None);

        compute_stats(ctx.clone(), request("q", "c")).await.unwrap();
        compute_stats(ctx, request("q", "c")).await.unwrap();

        assert_eq!(store.cached_len(), 0);
        assert_eq!(aligner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn visualization_failure_is_swallowed() {
        let store = Arc::new(MemoryStore::new());
        let aligner = Arc::new(FakeAligner::new(0.9, Duration::ZERO));
        let visualizer = Arc::new(FailingVisualizer {
            calls: AtomicUsize::new(0),
        });
        let ctx = context(store, aligner, Some(visualizer.clone()));

        let stat = compute_stats(ctx, request("q", "c")).await.unwrap();

        assert_eq!(stat.qscore, 0.9);
        assert_eq!(visualizer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn visualization_skipped_below_threshold_or_when_disabled() {
        let store = Arc::new(MemoryStore::new());
        let visualizer = Arc::new(FailingVisualizer {
            calls: AtomicUsize::new(0),
        });

        let low = context(
            store.clone(),
            Arc::new(FakeAligner::new(0.3, Duration::ZERO)),
            Some(visualizer.clone()),
        );
        compute_stats(low, request("q", "c")).await.unwrap();

        let high = context(
            store,
            Arc::new(FakeAligner::new(0.9, Duration::ZERO)),
            Some(visualizer.clone()),
        );
        let mut disabled = request("q", "d");
        disabled.disable_visualizations = true;
        compute_stats(high, disabled).await.unwrap();

        assert_eq!(visualizer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn computation_failure_is_reported() {
        let store = Arc::new(MemoryStore::new());
        let mut aligner = FakeAligner::new(0.9, Duration::ZERO);
        aligner.fail = true;
        let ctx = context(store, Arc::new(aligner), None);

        let err = compute_stats(ctx, request("q", "c")).await.unwrap_err();
        assert!(matches!(err, DetailError::Computation(_)));
    }
}
