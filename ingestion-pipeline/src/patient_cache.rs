use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use common::error::AppError;
use tracing::{error, info, instrument};

use crate::{catalog::FileCatalog, types::Partition};

#[derive(Default)]
struct CacheState {
    partitions: HashMap<String, Partition>,
    /// Rejected assignment per conflicted patient.
    conflicted: HashMap<String, Partition>,
}

/// What seeding the cache from processed data found.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SeedSummary {
    pub records: usize,
    pub patients: usize,
    pub contradictions: usize,
}

/// Pseudonym to partition map shared by all workers of a run.
///
/// `add` checks and inserts under one lock, so two workers racing on the same
/// new patient either agree or one of them gets a contradiction.
#[derive(Default)]
pub struct PatientPartitionCache {
    inner: Mutex<CacheState>,
}

impl PatientPartitionCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record `partition` for `pseudonym`.
    ///
    /// Re-adding the same assignment is a no-op. A different assignment fails
    /// with [`AppError::CacheContradiction`], and the patient is marked as
    /// conflicted for the rest of the run.
    pub fn add(&self, pseudonym: &str, partition: Partition) -> Result<(), AppError> {
        let mut state = self.lock();
        match state.partitions.get(pseudonym).copied() {
            None => {
                state.partitions.insert(pseudonym.to_string(), partition);
                Ok(())
            }
            Some(existing) if existing == partition => Ok(()),
            Some(existing) => {
                state.conflicted.insert(pseudonym.to_string(), partition);
                Err(contradiction(pseudonym, existing, partition))
            }
        }
    }

    pub fn get(&self, pseudonym: &str) -> Option<Partition> {
        self.lock().partitions.get(pseudonym).copied()
    }

    /// Partition of `pseudonym`, refusing patients already found in both.
    pub fn lookup(&self, pseudonym: &str) -> Result<Option<Partition>, AppError> {
        let state = self.lock();
        let existing = state.partitions.get(pseudonym).copied();
        match (existing, state.conflicted.get(pseudonym)) {
            (Some(existing), Some(attempted)) => Err(contradiction(pseudonym, existing, *attempted)),
            _ => Ok(existing),
        }
    }

    /// Patients found in both partitions, sorted.
    pub fn conflicted(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().conflicted.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.lock().partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Load every assignment already present in the lake.
    ///
    /// Contradictions in existing data are logged and counted; the affected
    /// patients stay conflicted so none of their new files get placed.
    #[instrument(skip_all)]
    pub async fn seed(&self, catalog: &FileCatalog) -> Result<SeedSummary, AppError> {
        let records = catalog.processed_clinical().await?;
        let mut summary = SeedSummary {
            records: records.len(),
            ..SeedSummary::default()
        };
        for record in records {
            if let Err(err) = self.add(&record.pseudonym, record.partition) {
                error!(
                    key = %record.key,
                    pseudonym = %record.pseudonym,
                    error = %err,
                    "Processed data places a patient in both partitions"
                );
                summary.contradictions = summary.contradictions.saturating_add(1);
            }
        }
        summary.patients = self.len();
        info!(
            records = summary.records,
            patients = summary.patients,
            contradictions = summary.contradictions,
            "Patient partition cache seeded"
        );
        Ok(summary)
    }
}

fn contradiction(pseudonym: &str, existing: Partition, attempted: Partition) -> AppError {
    AppError::CacheContradiction {
        pseudonym: pseudonym.to_string(),
        existing: existing.to_string(),
        attempted: attempted.to_string(),
    }
}
