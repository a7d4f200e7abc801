use std::fmt;

use common::error::AppError;
use serde::Serialize;

use crate::patient_cache::SeedSummary;

/// Why an item was left where it is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Neither a clinical record nor an image.
    Unrecognized,
    /// File name does not carry a pseudonym and outcome.
    UnparseableName,
    /// Key has no `YYYY-MM-DD` folder.
    MissingDate,
    /// Clinical record without a submitting site.
    MissingSite,
    /// Submitting site absent from the warehouse configuration.
    UnknownSite(String),
    /// Image whose patient has no partition yet.
    PartitionUnknown(String),
    /// Image header lacks an attribute needed to place it.
    MissingHeaderField(&'static str),
    /// Every destination already exists.
    AlreadyProcessed,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unrecognized => f.write_str("unrecognized key"),
            Self::UnparseableName => f.write_str("unparseable file name"),
            Self::MissingDate => f.write_str("no date folder in key"),
            Self::MissingSite => f.write_str("no submitting site"),
            Self::UnknownSite(site) => write!(f, "site {site} is not configured"),
            Self::PartitionUnknown(patient) => write!(f, "no partition known for patient {patient}"),
            Self::MissingHeaderField(field) => write!(f, "image header has no {field}"),
            Self::AlreadyProcessed => f.write_str("already processed"),
        }
    }
}

#[derive(Debug)]
pub enum ItemOutcome {
    Processed,
    Skipped(SkipReason),
    Failed(AppError),
}

impl ItemOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Processed => "processed",
            Self::Skipped(_) => "skipped",
            Self::Failed(_) => "failed",
        }
    }

    pub fn reason(&self) -> Option<String> {
        match self {
            Self::Processed => None,
            Self::Skipped(reason) => Some(reason.to_string()),
            Self::Failed(err) => Some(err.to_string()),
        }
    }
}

/// One row of the ingestion export.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ItemRecord {
    pub key: String,
    pub kind: Option<&'static str>,
    pub outcome: &'static str,
    pub reason: Option<String>,
    pub pseudonym: Option<String>,
    pub partition: Option<&'static str>,
    /// Destination keys, `;` separated.
    pub destinations: String,
    pub copies: usize,
    pub uploads: usize,
    pub planned: usize,
    #[serde(skip)]
    pub contradiction: bool,
}

/// Counters for one stream of keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamReport {
    pub discovered: usize,
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub contradictions: usize,
    pub copies: usize,
    pub uploads: usize,
    pub planned: usize,
    pub records: Vec<ItemRecord>,
}

impl StreamReport {
    pub fn from_records(mut records: Vec<ItemRecord>) -> Self {
        records.sort_by(|a, b| a.key.cmp(&b.key));
        let mut report = Self {
            discovered: records.len(),
            ..Self::default()
        };
        for record in &records {
            let counter = match record.outcome {
                "processed" => &mut report.processed,
                "skipped" => &mut report.skipped,
                _ => &mut report.failed,
            };
            *counter = counter.saturating_add(1);
            if record.contradiction {
                report.contradictions = report.contradictions.saturating_add(1);
            }
            report.copies = report.copies.saturating_add(record.copies);
            report.uploads = report.uploads.saturating_add(record.uploads);
            report.planned = report.planned.saturating_add(record.planned);
        }
        report.records = records;
        report
    }

    pub fn mutations(&self) -> usize {
        self.copies.saturating_add(self.uploads)
    }
}

/// Everything one ingestion run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub run_id: String,
    pub dry_run: bool,
    /// False when the warehouse configuration object was missing.
    pub configured: bool,
    pub seed: SeedSummary,
    pub clinical: StreamReport,
    pub images: StreamReport,
}

impl RunReport {
    pub fn unconfigured(run_id: String, dry_run: bool) -> Self {
        Self {
            run_id,
            dry_run,
            configured: false,
            ..Self::default()
        }
    }

    pub fn records(&self) -> impl Iterator<Item = &ItemRecord> {
        self.clinical.records.iter().chain(self.images.records.iter())
    }

    pub fn contradictions(&self) -> usize {
        self.seed
            .contradictions
            .saturating_add(self.clinical.contradictions)
            .saturating_add(self.images.contradictions)
    }

    pub fn has_contradictions(&self) -> bool {
        self.contradictions() > 0
    }

    pub fn mutations(&self) -> usize {
        self.clinical.mutations().saturating_add(self.images.mutations())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(key: &str, outcome: &'static str, copies: usize) -> ItemRecord {
        ItemRecord {
            key: key.into(),
            outcome,
            copies,
            ..ItemRecord::default()
        }
    }

    #[test]
    fn stream_report_counts_outcomes() {
        let report = StreamReport::from_records(vec![
            record("b", "processed", 1),
            record("a", "skipped", 0),
            ItemRecord {
                contradiction: true,
                ..record("c", "failed", 0)
            },
        ]);
        assert_eq!(report.discovered, 3);
        assert_eq!((report.processed, report.skipped, report.failed), (1, 1, 1));
        assert_eq!(report.contradictions, 1);
        assert_eq!(report.mutations(), 1);
        assert_eq!(report.records.first().map(|r| r.key.as_str()), Some("a"));
    }

    #[test]
    fn skip_reasons_read_well() {
        assert_eq!(
            SkipReason::UnknownSite("Royal Hospital".into()).to_string(),
            "site Royal Hospital is not configured"
        );
        assert_eq!(ItemOutcome::Skipped(SkipReason::MissingSite).label(), "skipped");
    }
}
