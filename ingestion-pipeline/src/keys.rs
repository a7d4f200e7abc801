//! Object key conventions of the warehouse bucket.
//!
//! Raw uploads live under `raw-<source>/<YYYY-MM-DD>/{data|images}/<name>`,
//! processed files under `{training|validation}/{data|<type>|<type>-metadata}/<pseudonym>/...`.

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

use crate::types::{ClinicalOutcome, Partition};

#[allow(clippy::expect_used)]
pub(crate) fn compile(pattern: &str) -> Regex {
    Regex::new(pattern).expect("static key pattern must compile")
}

static DATE_IN_KEY: LazyLock<Regex> =
    LazyLock::new(|| compile(r"^.+/(?P<date>\d{4}-\d{2}-\d{2})/.+"));

static CLINICAL_STEM: LazyLock<Regex> =
    LazyLock::new(|| compile(r"^(?P<pseudonym>.*)_(?P<outcome>data|status)$"));

/// What kind of raw object a key refers to, judged by location and suffix only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawKind {
    Clinical,
    Image,
}

/// Classify a raw key. Anything that is neither a `.json` under `data/`
/// nor a `.dcm` under `images/` returns `None`.
pub fn classify_raw_key(key: &str) -> Option<RawKind> {
    let (folder, name) = parent_folder_and_name(key)?;
    match folder {
        "data" if has_extension(name, "json") => Some(RawKind::Clinical),
        "images" if has_extension(name, "dcm") => Some(RawKind::Image),
        _ => None,
    }
}

/// The `YYYY-MM-DD` folder a raw key was uploaded under.
pub fn date_from_key(key: &str) -> Option<&str> {
    DATE_IN_KEY
        .captures(key)
        .and_then(|caps| caps.name("date"))
        .map(|m| m.as_str())
}

/// Split a clinical file name `<pseudonym>_(data|status).json` into its parts.
pub fn parse_clinical_name(key: &str) -> Option<(String, ClinicalOutcome)> {
    let stem = Path::new(key).file_stem()?.to_str()?;
    let caps = CLINICAL_STEM.captures(stem)?;
    let pseudonym = caps.name("pseudonym")?.as_str();
    if pseudonym.is_empty() {
        return None;
    }
    let outcome = match caps.name("outcome")?.as_str() {
        "data" => ClinicalOutcome::Data,
        _ => ClinicalOutcome::Status,
    };
    Some((pseudonym.to_string(), outcome))
}

pub fn clinical_destination(
    partition: Partition,
    pseudonym: &str,
    outcome: ClinicalOutcome,
    date: &str,
) -> String {
    format!(
        "{}/data/{pseudonym}/{}_{date}.json",
        partition.as_str(),
        outcome.as_str()
    )
}

/// Where an image and its scrubbed metadata land in the lake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageDestinations {
    pub image_key: String,
    pub metadata_key: String,
}

pub struct ImageIdentity<'a> {
    pub partition: Partition,
    pub image_type: &'a str,
    pub patient_id: &'a str,
    pub study_id: &'a str,
    pub series_id: &'a str,
}

pub fn image_destinations(identity: &ImageIdentity<'_>, raw_key: &str) -> Option<ImageDestinations> {
    let path = Path::new(raw_key);
    let file_name = path.file_name()?.to_str()?;
    let stem = path.file_stem()?.to_str()?;
    let ImageIdentity {
        partition,
        image_type,
        patient_id,
        study_id,
        series_id,
    } = identity;
    let partition = partition.as_str();

    Some(ImageDestinations {
        image_key: format!("{partition}/{image_type}/{patient_id}/{study_id}/{series_id}/{file_name}"),
        metadata_key: format!(
            "{partition}/{image_type}-metadata/{patient_id}/{study_id}/{series_id}/{stem}.json"
        ),
    })
}

/// Name of the metadata document written for an image file name.
pub fn metadata_name(image_name: &str) -> String {
    let split = image_name.len().saturating_sub(4);
    match (image_name.get(..split), image_name.get(split..)) {
        (Some(stem), Some(ext)) if ext.eq_ignore_ascii_case(".dcm") => format!("{stem}.json"),
        _ => image_name.to_string(),
    }
}

fn parent_folder_and_name(key: &str) -> Option<(&str, &str)> {
    let (parent, name) = key.rsplit_once('/')?;
    let folder = parent.rsplit('/').next()?;
    Some((folder, name))
}

fn has_extension(name: &str, extension: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case(extension))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_raw_keys_by_folder_and_suffix() {
        assert_eq!(
            classify_raw_key("raw-nhs/2020-05-01/data/Covid10_data.json"),
            Some(RawKind::Clinical)
        );
        assert_eq!(
            classify_raw_key("raw-nhs/2020-05-01/images/1.2.3.DCM"),
            Some(RawKind::Image)
        );
        assert_eq!(classify_raw_key("raw-nhs/2020-05-01/images/notes.txt"), None);
        assert_eq!(classify_raw_key("raw-nhs/2020-05-01/data/scan.dcm"), None);
        assert_eq!(classify_raw_key("config.json"), None);
    }

    #[test]
    fn extracts_date_folder() {
        assert_eq!(
            date_from_key("raw-nhs/2020-05-01/data/Covid10_data.json"),
            Some("2020-05-01")
        );
        assert_eq!(date_from_key("raw-nhs/data/Covid10_data.json"), None);
    }

    #[test]
    fn parses_clinical_names() {
        assert_eq!(
            parse_clinical_name("raw-nhs/2020-05-01/data/Covid10_data.json"),
            Some(("Covid10".to_string(), ClinicalOutcome::Data))
        );
        assert_eq!(
            parse_clinical_name("raw-nhs/2020-05-01/data/Some_Patient_status.json"),
            Some(("Some_Patient".to_string(), ClinicalOutcome::Status))
        );
        assert_eq!(parse_clinical_name("raw-nhs/2020-05-01/data/Covid10.json"), None);
        assert_eq!(parse_clinical_name("raw-nhs/2020-05-01/data/_data.json"), None);
    }

    #[test]
    fn builds_destination_keys() {
        assert_eq!(
            clinical_destination(Partition::Training, "Covid10", ClinicalOutcome::Data, "2020-05-01"),
            "training/data/Covid10/data_2020-05-01.json"
        );

        let identity = ImageIdentity {
            partition: Partition::Validation,
            image_type: "xray",
            patient_id: "Covid10",
            study_id: "1.2",
            series_id: "1.2.3",
        };
        let destinations =
            image_destinations(&identity, "raw-nhs/2020-05-01/images/1.2.3.4.dcm").expect("keys");
        assert_eq!(
            destinations.image_key,
            "validation/xray/Covid10/1.2/1.2.3/1.2.3.4.dcm"
        );
        assert_eq!(
            destinations.metadata_key,
            "validation/xray-metadata/Covid10/1.2/1.2.3/1.2.3.4.json"
        );
    }

    #[test]
    fn maps_image_names_to_metadata_names() {
        assert_eq!(metadata_name("1.2.3.dcm"), "1.2.3.json");
        assert_eq!(metadata_name("1.2.3.DCM"), "1.2.3.json");
        assert_eq!(metadata_name("1.2.3.json"), "1.2.3.json");
    }
}
