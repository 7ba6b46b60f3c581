//! Per-series model generation state.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    scene::ModelManifest,
};

/// `NotStarted -> Generating -> {Complete | Error}`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum GenerationStatus {
    #[default]
    NotStarted,
    Generating {
        progress: u8,
    },
    Complete {
        model_info: ModelManifest,
    },
    Error {
        message: String,
    },
}

impl GenerationStatus {
    pub fn is_generating(&self) -> bool {
        matches!(self, GenerationStatus::Generating { .. })
    }
}

/// Identifies one generation run. Updates carrying an older ticket are ignored.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JobTicket(u64);

struct Job {
    ticket: JobTicket,
    status: GenerationStatus,
    /// Set when the analysis the run started from was replaced.
    invalidated: bool,
}

#[derive(Default)]
struct Jobs {
    next_ticket: u64,
    by_series: HashMap<String, Job>,
}

impl Jobs {
    /// The job `ticket` refers to, if it is still the series' latest run.
    fn get_mut(&mut self, series_id: &str, ticket: JobTicket) -> Option<&mut Job> {
        self.by_series
            .get_mut(series_id)
            .filter(|job| job.ticket == ticket)
    }
}

/// Single source of truth for generation jobs. Cheap to clone.
#[derive(Clone, Default)]
pub struct JobManager {
    jobs: Arc<Mutex<Jobs>>,
}

impl JobManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn jobs(&self) -> MutexGuard<'_, Jobs> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark `series_id` as generating unless it already is.
    ///
    /// # Errors
    ///
    /// Returns [`Error::GenerationAlreadyInProgress`] if a job is in flight,
    /// including one that was invalidated but has not finished yet.
    pub fn try_start(&self, series_id: &str) -> Result<JobTicket> {
        let mut jobs = self.jobs();
        if jobs
            .by_series
            .get(series_id)
            .is_some_and(|job| job.status.is_generating())
        {
            return Err(Error::GenerationAlreadyInProgress(series_id.to_string()));
        }
        jobs.next_ticket += 1;
        let ticket = JobTicket(jobs.next_ticket);
        jobs.by_series.insert(
            series_id.to_string(),
            Job {
                ticket,
                status: GenerationStatus::Generating { progress: 0 },
                invalidated: false,
            },
        );
        Ok(ticket)
    }

    /// Raise the progress of a running job. Ignored otherwise.
    pub fn set_progress(&self, series_id: &str, ticket: JobTicket, value: u8) {
        if let Some(Job {
            status: GenerationStatus::Generating { progress },
            ..
        }) = self.jobs().get_mut(series_id, ticket)
        {
            *progress = (*progress).max(value.min(100));
        }
    }

    /// Whether the run may still publish its result.
    pub fn is_current(&self, series_id: &str, ticket: JobTicket) -> bool {
        self.jobs()
            .get_mut(series_id, ticket)
            .is_some_and(|job| job.status.is_generating() && !job.invalidated)
    }

    /// Record the finished model. Returns `false`, leaving the job running,
    /// if the run was invalidated or superseded.
    pub fn complete(&self, series_id: &str, ticket: JobTicket, model_info: ModelManifest) -> bool {
        match self.jobs().get_mut(series_id, ticket) {
            Some(job) if job.status.is_generating() && !job.invalidated => {
                job.status = GenerationStatus::Complete { model_info };
                true
            }
            _ => false,
        }
    }

    /// End the run with an error. An invalidated run is forgotten instead.
    pub fn fail(&self, series_id: &str, ticket: JobTicket, message: impl Into<String>) {
        let mut jobs = self.jobs();
        let Some(job) = jobs.get_mut(series_id, ticket) else {
            return;
        };
        if job.invalidated {
            jobs.by_series.remove(series_id);
        } else {
            job.status = GenerationStatus::Error {
                message: message.into(),
            };
        }
    }

    /// Current state, [`GenerationStatus::NotStarted`] if unknown.
    pub fn status(&self, series_id: &str) -> GenerationStatus {
        self.jobs()
            .by_series
            .get(series_id)
            .map(|job| job.status.clone())
            .unwrap_or_default()
    }

    /// Forget the job. Returns whether one was recorded.
    ///
    /// A running job stays registered until its worker returns, so no second
    /// run can start meanwhile. Its result is discarded.
    pub fn clear(&self, series_id: &str) -> bool {
        let mut jobs = self.jobs();
        let Some(job) = jobs.by_series.get_mut(series_id) else {
            return false;
        };
        if job.status.is_generating() {
            job.invalidated = true;
        } else {
            jobs.by_series.remove(series_id);
        }
        true
    }
}
