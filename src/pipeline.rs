#![forbid(unsafe_code)]

//! The run controller: one pass of search, download, validate, publish.
//!
//! Every collaborator sits behind a trait so the decision logic can be driven
//! by in-memory fakes. The controller owns two pieces of state per run, the
//! success count and the quota-halt flag; everything durable goes through
//! [`PublishedStore`], which is re-read before each duplicate check.

use anyhow::{Result, bail};
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::probe::ValidationOutcome;
use crate::publish::{PublishError, PublishRequest};
use crate::store::PublishedStore;

/// A search hit that might be republished. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub id: String,
    pub title: String,
    pub url: String,
}

/// Extended metadata from the per-video detail lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VideoDetails {
    pub duration: Option<String>,
    pub view_count: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub query: String,
    pub max_results: u32,
    pub duration: String,
}

impl SearchRequest {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            query: config.search_query.clone(),
            max_results: config.max_results,
            duration: config.duration_filter.clone(),
        }
    }
}

/// Finds Creative-Commons short videos, most viewed first.
pub trait CandidateSource {
    fn search(&self, request: &SearchRequest) -> Result<Vec<Candidate>>;

    /// `None` when details are unavailable for any reason.
    fn details(&self, id: &str) -> Option<VideoDetails>;
}

pub trait Retriever {
    fn retrieve(&self, url: &str, dest: &Path) -> Result<()>;
}

/// Never fails; a media file that cannot be inspected is simply rejected.
pub trait FormatValidator {
    fn validate(&self, media: &Path) -> ValidationOutcome;
}

/// Returns the identifier assigned by the target platform.
pub trait Publisher {
    fn publish(&self, media: &Path, request: &PublishRequest) -> Result<String, PublishError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    CapReached,
    QuotaExceeded,
    CandidatesExhausted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publication {
    pub source_id: String,
    pub published_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunResult {
    pub successes: usize,
    pub quota_halted: bool,
    pub stop_reason: StopReason,
    pub published: Vec<Publication>,
}

impl RunResult {
    pub fn summary(&self) -> String {
        let mut line = format!("Uploaded {} video(s)", self.successes);
        if self.quota_halted {
            line.push_str("; stopped early: publishing quota exceeded");
        }
        line
    }
}

/// What happened to one candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Outcome {
    Skipped,
    Published(String),
    QuotaHit,
}

pub struct RunController<'a> {
    config: &'a PipelineConfig,
    store: &'a PublishedStore,
    downloads: PathBuf,
    source: &'a dyn CandidateSource,
    retriever: &'a dyn Retriever,
    validator: &'a dyn FormatValidator,
    publisher: &'a dyn Publisher,
}

impl<'a> RunController<'a> {
    pub fn new(
        config: &'a PipelineConfig,
        store: &'a PublishedStore,
        downloads: impl Into<PathBuf>,
        source: &'a dyn CandidateSource,
        retriever: &'a dyn Retriever,
        validator: &'a dyn FormatValidator,
        publisher: &'a dyn Publisher,
    ) -> Self {
        Self {
            config,
            store,
            downloads: downloads.into(),
            source,
            retriever,
            validator,
            publisher,
        }
    }

    /// Executes one run. Errors are reserved for fatal conditions: search
    /// failure, an empty result set, or an unreadable/unwritable store.
    pub fn run(&self) -> Result<RunResult> {
        let request = SearchRequest::from_config(self.config);
        info!(query = %request.query, "searching for Creative Commons shorts");
        let candidates = self.source.search(&request)?;
        if candidates.is_empty() {
            bail!("no videos found for query {:?}", request.query);
        }
        info!(found = candidates.len(), "processing candidates");

        let mut result = RunResult {
            successes: 0,
            quota_halted: false,
            stop_reason: StopReason::CandidatesExhausted,
            published: Vec::new(),
        };

        for (index, candidate) in candidates.iter().enumerate() {
            if result.successes >= self.config.run_cap {
                info!(cap = self.config.run_cap, "run cap reached");
                result.stop_reason = StopReason::CapReached;
                break;
            }
            if result.quota_halted {
                result.stop_reason = StopReason::QuotaExceeded;
                break;
            }
            info!(
                video_id = %candidate.id,
                "[{}/{}] {}",
                index + 1,
                candidates.len(),
                candidate.title
            );

            match self.process(candidate)? {
                Outcome::Skipped => {}
                Outcome::Published(published_id) => {
                    result.successes += 1;
                    result.published.push(Publication {
                        source_id: candidate.id.clone(),
                        published_id,
                    });
                    let delay = self.config.throttle_delay();
                    if !delay.is_zero() {
                        debug!(secs = delay.as_secs(), "throttling before next candidate");
                        thread::sleep(delay);
                    }
                }
                Outcome::QuotaHit => {
                    result.quota_halted = true;
                }
            }
        }

        // The loop may end on the last candidate right after a state change.
        if result.quota_halted {
            result.stop_reason = StopReason::QuotaExceeded;
        } else if result.successes >= self.config.run_cap {
            result.stop_reason = StopReason::CapReached;
        }
        Ok(result)
    }

    fn process(&self, candidate: &Candidate) -> Result<Outcome> {
        if self.store.contains(&candidate.id)? {
            info!(video_id = %candidate.id, "already uploaded, skipping");
            return Ok(Outcome::Skipped);
        }
        if !is_safe_file_stem(&candidate.id) {
            warn!(video_id = %candidate.id, "id is not usable as a file name, skipping");
            return Ok(Outcome::Skipped);
        }

        let Some(details) = self.source.details(&candidate.id) else {
            warn!(video_id = %candidate.id, "details unavailable, skipping");
            return Ok(Outcome::Skipped);
        };
        debug!(
            video_id = %candidate.id,
            duration = ?details.duration,
            views = ?details.view_count,
            "fetched details"
        );

        let media = self.downloads.join(format!("{}.mp4", candidate.id));
        if let Err(err) = self.retriever.retrieve(&candidate.url, &media) {
            warn!(video_id = %candidate.id, "download failed: {err:#}");
            discard(&media);
            return Ok(Outcome::Skipped);
        }

        let validation = self.validator.validate(&media);
        if !validation.accepted {
            info!(
                video_id = %candidate.id,
                dimensions = ?validation.dimensions,
                "not vertical, skipping"
            );
            discard(&media);
            return Ok(Outcome::Skipped);
        }

        let request = PublishRequest::for_candidate(candidate, self.config);
        let published = self.publisher.publish(&media, &request);
        discard(&media);

        match published {
            Ok(published_id) => {
                // Keyed by the source id so the same clip is never picked
                // again even though it now lives under a new id.
                self.store.record(&candidate.id)?;
                info!(
                    video_id = %candidate.id,
                    published_id = %published_id,
                    "uploaded"
                );
                Ok(Outcome::Published(published_id))
            }
            Err(PublishError::QuotaExceeded(message)) => {
                warn!(
                    video_id = %candidate.id,
                    "quota exceeded, halting this run: {message}"
                );
                Ok(Outcome::QuotaHit)
            }
            Err(err @ PublishError::Other(_)) => {
                warn!(video_id = %candidate.id, "{err}");
                Ok(Outcome::Skipped)
            }
        }
    }
}

fn is_safe_file_stem(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
}

fn discard(media: &Path) {
    if media.exists()
        && let Err(err) = fs::remove_file(media)
    {
        warn!("could not remove {}: {err}", media.display());
    }
}
