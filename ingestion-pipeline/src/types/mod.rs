use std::fmt;

use serde::Serialize;

/// Which half of the data lake a patient belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Partition {
    Training,
    Validation,
}

impl Partition {
    pub fn from_is_training(is_training: bool) -> Self {
        if is_training {
            Self::Training
        } else {
            Self::Validation
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Training => "training",
            Self::Validation => "validation",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "training" => Some(Self::Training),
            "validation" => Some(Self::Validation),
            _ => None,
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a submitting site's patients are assigned to partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiteGroup {
    Training,
    Validation,
    Split,
}

/// Covid outcome encoded in a clinical file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ClinicalOutcome {
    /// `<pseudonym>_data.json`: covid positive.
    Data,
    /// `<pseudonym>_status.json`: covid negative.
    Status,
}

impl ClinicalOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Data => "data",
            Self::Status => "status",
        }
    }
}

/// Lake folder name for a DICOM modality code.
pub fn image_type_for_modality(modality: &str) -> &'static str {
    match modality.trim() {
        "DX" | "CR" => "xray",
        "MR" => "mri",
        "CT" => "ct",
        _ => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_modalities_to_lake_folders() {
        assert_eq!(image_type_for_modality("DX"), "xray");
        assert_eq!(image_type_for_modality("CR"), "xray");
        assert_eq!(image_type_for_modality("MR"), "mri");
        assert_eq!(image_type_for_modality("CT "), "ct");
        assert_eq!(image_type_for_modality("US"), "unknown");
    }

    #[test]
    fn partition_round_trips_through_prefix_names() {
        for partition in [Partition::Training, Partition::Validation] {
            assert_eq!(Partition::parse(partition.as_str()), Some(partition));
        }
        assert_eq!(Partition::parse("split"), None);
    }
}
