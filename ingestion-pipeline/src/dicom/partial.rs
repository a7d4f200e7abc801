use common::{error::AppError, storage::store::StorageManager};
use tracing::debug;

use super::{parse_header, DicomHeader, HeaderParseError};

pub const DEFAULT_INITIAL_RANGE_KB: usize = 20;

/// Reads an image header by downloading a growing prefix of the object.
#[derive(Debug, Clone, Copy)]
pub struct PartialDicomReader {
    initial_range_kb: usize,
}

impl Default for PartialDicomReader {
    fn default() -> Self {
        Self::new(DEFAULT_INITIAL_RANGE_KB)
    }
}

impl PartialDicomReader {
    pub fn new(initial_range_kb: usize) -> Self {
        Self {
            initial_range_kb: initial_range_kb.max(1),
        }
    }

    /// Fetch `[0, n)` and parse it, doubling `n` until the pixel data element
    /// is reached or the whole object has been read.
    pub async fn read(&self, storage: &StorageManager, key: &str) -> Result<DicomHeader, AppError> {
        let mut range_kb = self.initial_range_kb;
        loop {
            let requested = range_kb.saturating_mul(1024);
            let data = storage.get_range(key, 0..requested).await?;
            let whole_object = data.len() < requested;

            match parse_header(&data) {
                Ok(parsed) if parsed.reached_pixel_data || whole_object => {
                    debug!(
                        key,
                        range_kb,
                        bytes = data.len(),
                        reached_pixel_data = parsed.reached_pixel_data,
                        "Parsed image header"
                    );
                    return Ok(parsed.header);
                }
                Ok(_) => {}
                Err(HeaderParseError::Truncated { .. }) if !whole_object => {}
                Err(err) => return Err(AppError::HeaderParse(format!("{key}: {err}"))),
            }

            range_kb = range_kb
                .checked_mul(2)
                .ok_or_else(|| AppError::HeaderParse(format!("{key}: header too large")))?;
            debug!(key, range_kb, "Header does not fit in range; retrying with a larger one");
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use common::storage::store::testing::memory_bucket;

    use super::*;
    use crate::dicom::{
        parse_header,
        testing::{sample_image, DicomBuilder},
        tags, Tag,
    };

    #[tokio::test]
    async fn header_is_independent_of_the_initial_range() {
        let storage = memory_bucket("warehouse");
        for (key, implicit) in [("explicit.dcm", false), ("implicit.dcm", true)] {
            // Header spills well past the default range.
            let file = sample_image("Covid10", implicit, 60 * 1024);
            let expected = parse_header(&file).expect("full parse").header;
            storage.put(key, Bytes::from(file)).await.expect("put");

            for kb in [1, 5, 20, 50, 100, 500] {
                let header = PartialDicomReader::new(kb)
                    .read(&storage, key)
                    .await
                    .expect("partial read");
                assert_eq!(header.tag_set(), expected.tag_set(), "initial range {kb} KB");
                assert_eq!(header, expected);
            }
        }
    }

    #[tokio::test]
    async fn small_file_without_pixel_data_is_read_once() {
        let storage = memory_bucket("warehouse");
        let file = DicomBuilder::explicit()
            .text(tags::PATIENT_ID, b"LO", "Covid12")
            .text(tags::MODALITY, b"CS", "CT")
            .file();
        storage.put("small.dcm", Bytes::from(file)).await.expect("put");

        let header = PartialDicomReader::default()
            .read(&storage, "small.dcm")
            .await
            .expect("read");
        assert_eq!(header.patient_id(), Some("Covid12"));
        assert!(header.dataset.get(Tag::PIXEL_DATA).is_none());
    }

    #[tokio::test]
    async fn truncated_and_foreign_files_fail() {
        let storage = memory_bucket("warehouse");
        let mut file = sample_image("Covid10", false, 8 * 1024);
        file.truncate(2048);
        storage.put("cut.dcm", Bytes::from(file)).await.expect("put");
        storage
            .put("notes.dcm", Bytes::from(vec![b'x'; 4096]))
            .await
            .expect("put");

        let reader = PartialDicomReader::new(1);
        for key in ["cut.dcm", "notes.dcm"] {
            let err = reader.read(&storage, key).await.expect_err("must fail");
            assert!(matches!(err, AppError::HeaderParse(_)), "{key}: {err}");
        }
        assert!(matches!(
            reader.read(&storage, "missing.dcm").await,
            Err(AppError::ObjectStore(_))
        ));
    }
}
