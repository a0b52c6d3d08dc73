use std::collections::{HashSet, VecDeque};
use std::fs;
use std::thread;
use std::time::Duration;

use rand::Rng;
use rand::seq::SliceRandom;
use serde::Serialize;

use crate::app::{ProgressEvent, ProgressSink};
use crate::domain::ObservationId;
use crate::error::{FailureClass, PipelineError};
use crate::images::{FetchedImage, ImageFetcher};
use crate::inat::{CatalogClient, CatalogPage, CatalogRecord, MAX_ACCESSIBLE_RESULTS, PageRequest};
use crate::store::ObservationStore;

pub const BUDGET_FACTOR: usize = 3;
const PAGE_SIZE: u32 = 200;
const MIN_POOL_TARGET: u64 = 200;
const POOL_FACTOR: u64 = 10;
const MAX_RANDOM_PAGES: u32 = 20;
const MAX_CONSECUTIVE_FAILURES: u32 = 3;

#[derive(Debug, Clone, Copy)]
pub struct FetchRequest {
    pub target: usize,
    pub max_attempts: Option<usize>,
}

impl FetchRequest {
    pub fn budget(&self) -> usize {
        self.max_attempts
            .unwrap_or_else(|| self.target.saturating_mul(BUDGET_FACTOR))
    }

    fn pool_target(&self) -> u64 {
        (self.target as u64)
            .saturating_mul(POOL_FACTOR)
            .max(MIN_POOL_TARGET)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum StopReason {
    Completed,
    BudgetExhausted,
    CatalogExhausted,
    Aborted { message: String, class: FailureClass },
}

#[derive(Debug, Clone, Serialize)]
pub struct FetchReport {
    pub target: usize,
    pub budget: usize,
    pub attempts: usize,
    pub succeeded: usize,
    pub skipped_duplicate: usize,
    pub failed: usize,
    pub stop: StopReason,
    pub ingested: Vec<ObservationId>,
}

impl FetchReport {
    fn new(request: &FetchRequest) -> Self {
        Self {
            target: request.target,
            budget: request.budget(),
            attempts: 0,
            succeeded: 0,
            skipped_duplicate: 0,
            failed: 0,
            stop: StopReason::Completed,
            ingested: Vec::new(),
        }
    }

    pub fn is_partial(&self) -> bool {
        self.succeeded < self.target
    }
}

#[derive(Debug, Clone, Copy)]
enum PagePlan {
    Unsized,
    Sequential { next_page: u32, last_page: u32 },
    RandomOffset { max_start: u64, pages_left: u32 },
    Exhausted,
}

/// Lazily paginated, shuffled candidates for one run.
///
/// The first pull asks for the catalog size. Small catalogs are walked page by
/// page; larger ones are sampled at uniformly random offsets. Every page is
/// shuffled, and an id is served at most once per stream. The stream ends on
/// an empty page, when its page plan runs out, or after repeated transient
/// failures.
pub struct CandidateStream<'a, C: CatalogClient, R: Rng> {
    client: &'a C,
    rng: &'a mut R,
    pool_target: u64,
    plan: PagePlan,
    buffer: VecDeque<CatalogRecord>,
    served: HashSet<ObservationId>,
    consecutive_failures: u32,
}

impl<'a, C: CatalogClient, R: Rng> CandidateStream<'a, C, R> {
    pub fn new(client: &'a C, rng: &'a mut R, pool_target: u64) -> Self {
        Self {
            client,
            rng,
            pool_target,
            plan: PagePlan::Unsized,
            buffer: VecDeque::new(),
            served: HashSet::new(),
            consecutive_failures: 0,
        }
    }

    fn next_request(&mut self) -> Option<PageRequest> {
        match self.plan {
            PagePlan::Unsized => Some(PageRequest::page(1, 1)),
            PagePlan::Sequential {
                next_page,
                last_page,
            } => (next_page <= last_page).then(|| PageRequest::page(next_page, PAGE_SIZE)),
            PagePlan::RandomOffset {
                max_start,
                pages_left,
            } => (pages_left > 0)
                .then(|| PageRequest::offset(self.rng.random_range(0..=max_start), PAGE_SIZE)),
            PagePlan::Exhausted => None,
        }
    }

    fn absorb(&mut self, page: CatalogPage) {
        self.plan = match self.plan {
            PagePlan::Unsized => self.plan_for_total(page.total_results),
            PagePlan::Sequential {
                next_page,
                last_page,
            } => {
                if page.results.is_empty() {
                    PagePlan::Exhausted
                } else {
                    self.enqueue(page.results);
                    PagePlan::Sequential {
                        next_page: next_page + 1,
                        last_page,
                    }
                }
            }
            PagePlan::RandomOffset {
                max_start,
                pages_left,
            } => {
                if page.results.is_empty() {
                    PagePlan::Exhausted
                } else {
                    self.enqueue(page.results);
                    PagePlan::RandomOffset {
                        max_start,
                        pages_left: pages_left - 1,
                    }
                }
            }
            PagePlan::Exhausted => PagePlan::Exhausted,
        };
    }

    fn plan_for_total(&self, total: u64) -> PagePlan {
        if total == 0 {
            return PagePlan::Exhausted;
        }
        if total <= self.pool_target {
            let pages = total.div_ceil(PAGE_SIZE as u64);
            tracing::info!(total, pages, "catalog is small, walking every page");
            return PagePlan::Sequential {
                next_page: 1,
                last_page: u32::try_from(pages).unwrap_or(u32::MAX),
            };
        }
        let accessible = total.min(MAX_ACCESSIBLE_RESULTS);
        tracing::info!(total, accessible, "sampling catalog at random offsets");
        PagePlan::RandomOffset {
            max_start: accessible.saturating_sub(PAGE_SIZE as u64),
            pages_left: MAX_RANDOM_PAGES,
        }
    }

    fn enqueue(&mut self, mut records: Vec<CatalogRecord>) {
        records.retain(|record| self.served.insert(record.id));
        records.shuffle(&mut *self.rng);
        self.buffer.extend(records);
    }
}

impl<C: CatalogClient, R: Rng> Iterator for CandidateStream<'_, C, R> {
    type Item = Result<CatalogRecord, PipelineError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(record) = self.buffer.pop_front() {
                return Some(Ok(record));
            }
            let request = self.next_request()?;
            match self.client.fetch_page(&request) {
                Ok(page) => {
                    self.consecutive_failures = 0;
                    self.absorb(page);
                }
                Err(err) if err.is_transient_fetch() => {
                    self.consecutive_failures += 1;
                    if self.consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                        tracing::warn!("catalog unavailable, giving up on further pages");
                        self.plan = PagePlan::Exhausted;
                    }
                    return Some(Err(err));
                }
                Err(err) => {
                    self.plan = PagePlan::Exhausted;
                    return Some(Err(err));
                }
            }
        }
    }
}

enum CandidateOutcome {
    Ingested(ObservationId),
    Duplicate,
    Failed,
}

/// Drives one ingestion run: candidates in, committed observations out.
pub struct Sampler<'a, C: CatalogClient, F: ImageFetcher> {
    catalog: &'a C,
    fetcher: &'a F,
    store: &'a ObservationStore,
    delay: Duration,
}

impl<'a, C: CatalogClient, F: ImageFetcher> Sampler<'a, C, F> {
    pub fn new(catalog: &'a C, fetcher: &'a F, store: &'a ObservationStore, delay: Duration) -> Self {
        Self {
            catalog,
            fetcher,
            store,
            delay,
        }
    }

    pub fn run<R: Rng>(
        &self,
        request: FetchRequest,
        rng: &mut R,
        sink: &dyn ProgressSink,
    ) -> Result<FetchReport, PipelineError> {
        let mut report = FetchReport::new(&request);
        if request.target == 0 {
            return Ok(report);
        }
        let budget = report.budget;
        let mut known = self.store.known_ids()?;
        tracing::info!(
            target = request.target,
            budget,
            stored = known.len(),
            "starting fetch run"
        );
        sink.event(ProgressEvent {
            message: format!(
                "phase=Resolve; {} observations already stored",
                known.len()
            ),
            elapsed: None,
        });

        let stream = CandidateStream::new(self.catalog, rng, request.pool_target());
        let mut stop = None;
        for item in stream.take(budget) {
            report.attempts += 1;
            let record = match item {
                Ok(record) => record,
                Err(err) if err.is_transient_fetch() => {
                    tracing::warn!(error = %err, "catalog page failed");
                    report.failed += 1;
                    continue;
                }
                Err(err) => {
                    stop = Some(abort(err));
                    break;
                }
            };
            match self.evaluate(record, &mut known, sink) {
                Ok(CandidateOutcome::Ingested(id)) => {
                    report.succeeded += 1;
                    report.ingested.push(id);
                    sink.event(ProgressEvent {
                        message: format!(
                            "phase=Store; observation {id} ({}/{})",
                            report.succeeded, request.target
                        ),
                        elapsed: None,
                    });
                    if report.succeeded >= request.target {
                        stop = Some(StopReason::Completed);
                        break;
                    }
                }
                Ok(CandidateOutcome::Duplicate) => report.skipped_duplicate += 1,
                Ok(CandidateOutcome::Failed) => report.failed += 1,
                Err(err) => {
                    stop = Some(abort(err));
                    break;
                }
            }
        }

        report.stop = stop.unwrap_or(if report.attempts >= budget {
            StopReason::BudgetExhausted
        } else {
            StopReason::CatalogExhausted
        });
        tracing::info!(
            succeeded = report.succeeded,
            skipped = report.skipped_duplicate,
            failed = report.failed,
            attempts = report.attempts,
            stop = ?report.stop,
            "fetch run finished"
        );
        Ok(report)
    }

    /// Per-candidate failures come back as `Failed`; only broken
    /// preconditions (filesystem, database) are returned as errors.
    fn evaluate(
        &self,
        record: CatalogRecord,
        known: &mut HashSet<ObservationId>,
        sink: &dyn ProgressSink,
    ) -> Result<CandidateOutcome, PipelineError> {
        let id = record.id;
        if !known.insert(id) {
            tracing::debug!(%id, "skipping known observation");
            return Ok(CandidateOutcome::Duplicate);
        }
        let Some(url) = record.photo_url.clone() else {
            tracing::warn!(%id, "observation has no photo");
            return Ok(CandidateOutcome::Failed);
        };

        sink.event(ProgressEvent {
            message: format!("phase=Fetch; downloading image for {id}"),
            elapsed: None,
        });
        let start = std::time::Instant::now();
        let fetched = self.fetcher.fetch(&url, id);
        let elapsed = start.elapsed();
        if !self.delay.is_zero() && !matches!(fetched, Ok(FetchedImage::AlreadyPresent(_))) {
            thread::sleep(self.delay);
        }
        let path = match fetched {
            Ok(FetchedImage::Downloaded(path)) => path,
            Ok(FetchedImage::AlreadyPresent(path)) => {
                tracing::info!(%id, %path, "image already on disk, treating as duplicate");
                return Ok(CandidateOutcome::Duplicate);
            }
            Err(err @ PipelineError::Transfer { .. }) => {
                tracing::warn!(%id, error = %err, "image transfer failed");
                return Ok(CandidateOutcome::Failed);
            }
            Err(err) => return Err(err),
        };
        tracing::debug!(%id, latency_ms = elapsed.as_millis() as u64, "image downloaded");

        let observation = record.into_observation(path.clone());
        match self.store.insert_observation(&observation) {
            Ok(()) => {
                tracing::info!(%id, "saved observation");
                Ok(CandidateOutcome::Ingested(id))
            }
            Err(PipelineError::DuplicateObservation(_)) => {
                tracing::info!(%id, "observation inserted concurrently, skipping");
                Ok(CandidateOutcome::Duplicate)
            }
            Err(err) => {
                if let Err(remove_err) = fs::remove_file(path.as_std_path()) {
                    tracing::warn!(%path, error = %remove_err, "could not remove orphaned image");
                }
                Err(err)
            }
        }
    }
}

fn abort(err: PipelineError) -> StopReason {
    tracing::error!(error = %err, "aborting fetch run");
    StopReason::Aborted {
        message: err.to_string(),
        class: err.class(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_defaults_to_three_times_target() {
        let request = FetchRequest {
            target: 7,
            max_attempts: None,
        };
        assert_eq!(request.budget(), 21);
        assert_eq!(request.pool_target(), 200);

        let request = FetchRequest {
            target: 50,
            max_attempts: Some(4),
        };
        assert_eq!(request.budget(), 4);
        assert_eq!(request.pool_target(), 500);
    }
}
