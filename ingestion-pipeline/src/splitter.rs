use sha2::{Digest, Sha512};

/// Decide whether a patient from a "split" site belongs to the training set.
///
/// The pseudonym is trimmed and upper-cased, hashed with SHA-512, and the
/// digest (read as a big-endian integer) is reduced modulo 100. Patients whose
/// bucket is below `training_percent` go to training. Percentages above 100
/// behave like 100.
pub fn is_training(pseudonym: &str, training_percent: u8) -> bool {
    bucket(pseudonym) < u32::from(training_percent)
}

/// The patient's position in `0..100`.
fn bucket(pseudonym: &str) -> u32 {
    let normalized = pseudonym.trim().to_uppercase();
    let digest = Sha512::digest(normalized.as_bytes());
    digest
        .iter()
        .fold(0u32, |acc, byte| {
            acc.saturating_mul(256).saturating_add(u32::from(*byte)) % 100
        })
}
