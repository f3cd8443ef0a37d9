//! Concurrent profile acquisition: search every query, download the
//! winners, merge payloads as they arrive.
//!
//! Searches and downloads share one semaphore, so at most `concurrency`
//! catalog calls are in flight at any moment. The first hard failure trips a
//! cancellation token at the failure site, before the slot is released;
//! queued tasks observe the token at the slot boundary and stop issuing
//! catalog calls, while calls already in flight are abandoned at their next
//! poll. The pipeline always drains both task groups before reporting the
//! first error.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::accumulator::{Accumulator, MergedProfile};
use crate::archive;
use crate::catalog::{CandidateProfile, ProfileCatalog};
use crate::error::{Error, Result};
use crate::pprof;
use crate::query::SelectionQuery;

/// Catalog calls allowed in flight at once.
pub const DEFAULT_CONCURRENCY: usize = 5;

/// Fans selection queries out to the catalog and folds the downloaded
/// profiles into one merged result.
pub struct AcquisitionPipeline {
    catalog: Arc<dyn ProfileCatalog>,
    concurrency: usize,
}

impl AcquisitionPipeline {
    pub fn new(catalog: Arc<dyn ProfileCatalog>) -> Self {
        Self {
            catalog,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    /// Cap on concurrent catalog calls. Values below one are clamped to one.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Run every query to completion and return the merged profile.
    pub async fn run(&self, queries: Vec<SelectionQuery>) -> Result<MergedProfile> {
        self.run_with_token(queries, CancellationToken::new()).await
    }

    /// Like [`run`](Self::run), but stops the run once `timeout` expires:
    /// queued tasks never reach the catalog and in-flight calls are
    /// abandoned, so the drain cannot be held up by a stalled peer. A run
    /// that completes despite the expired deadline returns its result.
    pub async fn run_with_timeout(
        &self,
        queries: Vec<SelectionQuery>,
        timeout: Duration,
    ) -> Result<MergedProfile> {
        let cancel = CancellationToken::new();
        let run = self.run_with_token(queries, cancel.clone());
        tokio::pin!(run);
        tokio::select! {
            result = &mut run => result,
            _ = tokio::time::sleep(timeout) => {
                cancel.cancel();
                match run.await {
                    Err(Error::Cancelled) => Err(Error::Timeout(timeout)),
                    other => other,
                }
            }
        }
    }

    async fn run_with_token(
        &self,
        queries: Vec<SelectionQuery>,
        cancel: CancellationToken,
    ) -> Result<MergedProfile> {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let accumulator = Arc::new(Accumulator::new());
        let mut first_error: Option<Error> = None;

        let mut searches = JoinSet::new();
        for query in queries {
            let catalog = Arc::clone(&self.catalog);
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            searches.spawn(async move { run_search(catalog, semaphore, cancel, query).await });
        }

        // Downloads spawn while the search group drains, so early winners
        // start downloading before the last search returns.
        let mut downloads = JoinSet::new();
        while let Some(joined) = searches.join_next().await {
            match flatten(joined) {
                Ok((query, candidates)) => {
                    for candidate in candidates {
                        let catalog = Arc::clone(&self.catalog);
                        let semaphore = Arc::clone(&semaphore);
                        let cancel = cancel.clone();
                        let accumulator = Arc::clone(&accumulator);
                        let term = query.filter.query.clone();
                        downloads.spawn(async move {
                            run_download(catalog, semaphore, cancel, accumulator, term, candidate)
                                .await
                        });
                    }
                }
                Err(err) => record_first_error(&mut first_error, &cancel, err),
            }
        }

        while let Some(joined) = downloads.join_next().await {
            if let Err(err) = flatten(joined) {
                record_first_error(&mut first_error, &cancel, err);
            }
        }

        if let Some(err) = first_error {
            return Err(err);
        }

        let accumulator = Arc::try_unwrap(accumulator).map_err(|_| {
            Error::Merge("accumulator still shared after pipeline drain".to_string())
        })?;
        accumulator.finalize()
    }
}

async fn run_search(
    catalog: Arc<dyn ProfileCatalog>,
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
    query: SelectionQuery,
) -> Result<(SelectionQuery, Vec<CandidateProfile>)> {
    let permit = acquire_slot(&semaphore, &cancel).await?;
    info!(
        "Searching profiles: {:?} (sort {} {}, {} to {})",
        query.filter.query, query.sort.field, query.sort.order, query.filter.from, query.filter.to
    );
    let start = Instant::now();
    let mut candidates = match cancel.run_until_cancelled(catalog.search(&query)).await {
        Some(Ok(candidates)) => candidates,
        Some(Err(err)) => {
            // Trip the token while the slot is still held, so queued tasks
            // see it before another catalog call starts.
            warn!("Search failed for {:?}: {err}", query.filter.query);
            cancel.cancel();
            return Err(err);
        }
        None => return Err(Error::Cancelled),
    };
    drop(permit);
    debug!(
        "Found {} candidate(s) for {:?} in {}ms",
        candidates.len(),
        query.filter.query,
        start.elapsed().as_millis()
    );
    // The catalog may return more rows than asked for.
    candidates.truncate(query.limit);
    Ok((query, candidates))
}

async fn run_download(
    catalog: Arc<dyn ProfileCatalog>,
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
    accumulator: Arc<Accumulator>,
    term: String,
    candidate: CandidateProfile,
) -> Result<()> {
    let permit = acquire_slot(&semaphore, &cancel).await?;
    let age_secs = (Utc::now() - candidate.timestamp).num_seconds();
    info!(
        "Downloading profile {} from {} ({:.1} cores, {:?}, {}s old)",
        candidate.profile_id, candidate.service, candidate.cpu_cores, candidate.duration, age_secs
    );
    let start = Instant::now();
    let payload = match cancel.run_until_cancelled(catalog.download(&candidate)).await {
        Some(Ok(payload)) => payload,
        Some(Err(err)) => {
            warn!(
                "Download failed for profile {} ({:?}): {err}",
                candidate.profile_id, term
            );
            cancel.cancel();
            return Err(err);
        }
        None => return Err(Error::Cancelled),
    };
    drop(permit);
    debug!(
        "Downloaded profile {} (event {}): {} bytes in {}ms",
        candidate.profile_id,
        candidate.event_id,
        payload.len(),
        start.elapsed().as_millis()
    );

    let merged = archive::extract_cpu_profile(&payload)
        .and_then(|raw| pprof::parse(&raw))
        .and_then(|profile| accumulator.merge(&candidate.profile_id, profile));
    if let Err(err) = merged {
        warn!(
            "Merge failed for profile {} ({:?}): {err}",
            candidate.profile_id, term
        );
        cancel.cancel();
        return Err(err);
    }
    Ok(())
}

/// Wait for a catalog slot, bailing out as soon as the pipeline is
/// cancelled. The biased order makes the token win over a free slot.
async fn acquire_slot(
    semaphore: &Arc<Semaphore>,
    cancel: &CancellationToken,
) -> Result<OwnedSemaphorePermit> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        permit = Arc::clone(semaphore).acquire_owned() => permit.map_err(|_| Error::Cancelled),
    }
}

/// Unwrap a joined task result. Panics propagate; an aborted task counts as
/// cancelled.
fn flatten<T>(joined: std::result::Result<Result<T>, JoinError>) -> Result<T> {
    match joined {
        Ok(result) => result,
        Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
        Err(_) => Err(Error::Cancelled),
    }
}

/// Keep the first hard failure. A real error displaces a bare cancellation,
/// since the cancellation was its consequence.
fn record_first_error(slot: &mut Option<Error>, cancel: &CancellationToken, err: Error) {
    cancel.cancel();
    match slot {
        None => *slot = Some(err),
        Some(Error::Cancelled) if !matches!(err, Error::Cancelled) => *slot = Some(err),
        Some(_) => {}
    }
}
