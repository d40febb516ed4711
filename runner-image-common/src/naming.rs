//! Well-known names shared by every builder process on a cloud account.
//!
//! Concurrent builders never coordinate directly: they agree on resources by
//! deriving the same names (and, for seed images, the same ids) from the same inputs.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{Arch, BaseImage, ParseError};

pub const BUILDER_KEYPAIR_NAME: &str = "image-builder-ssh-key";
pub const SHARED_SECURITY_GROUP_NAME: &str = "github-runner-image-builder-v1";
pub const SHARED_SECURITY_GROUP_DESCRIPTION: &str =
    "For builders managed by the github-runner-image-builder.";

// Image properties / server metadata keys.
pub const FAMILY_PROPERTY: &str = "image_builder_family";
pub const REVISION_PROPERTY: &str = "image_builder_revision";
pub const ARCHITECTURE_PROPERTY: &str = "architecture";
pub const RUN_ID_METADATA: &str = "image_builder_run";

const SEED_IMAGE_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2a3e_8d4b_4c7a_9e21_5b0d_3f6a_7c19);

const MAX_IMAGE_NAME_LEN: usize = 200;

/// Name of the uploaded Ubuntu cloud image builders boot from.
pub fn seed_image_name(arch: Arch, base: BaseImage) -> String {
    format!("image-builder-base-{}-{}", base.as_str(), arch.as_str())
}

/// Deterministic image id for a seed image.
///
/// - Same (arch, base, generation) always yields the same id
/// - The image store rejects a second create with an existing id, which is what
///   makes concurrent seeding converge on a single image
/// - Deleted image ids cannot be reused by the store, so re-seeding after a manual
///   delete requires bumping `generation`
pub fn seed_image_id(arch: Arch, base: BaseImage, generation: u32) -> Uuid {
    let key = format!("seed/{}/{}", generation, seed_image_name(arch, base));
    Uuid::new_v5(&SEED_IMAGE_NAMESPACE, key.as_bytes())
}

/// Per-run builder VM name. The run id suffix keeps parallel runs apart.
pub fn builder_name(arch: Arch, base: BaseImage, run_id: &Uuid) -> String {
    let short = run_id.simple().to_string();
    format!(
        "image-builder-{}-{}-{}",
        base.as_str(),
        arch.as_str(),
        &short[..8]
    )
}

/// Revision suffix: UTC timestamp with millisecond precision, then a nonce.
///
/// Suffixes sort lexicographically in creation order; the nonce breaks ties
/// between runs finishing in the same millisecond.
pub fn revision_suffix(at: DateTime<Utc>, nonce: &str) -> String {
    format!("{}-{}", at.format("%Y%m%dT%H%M%S%3fZ"), nonce)
}

pub fn new_revision_suffix(at: DateTime<Utc>) -> String {
    let nonce = Uuid::new_v4().simple().to_string();
    revision_suffix(at, &nonce[..6])
}

pub fn revision_image_name(family: &str, revision: &str) -> String {
    format!("{}-{}", family, revision)
}

/// Validate an artifact family name.
///
/// - Non-empty, at most 200 characters (room left for the revision suffix)
/// - ASCII alphanumerics plus `-`, `_` and `.`
pub fn validate_family_name(name: &str) -> Result<(), ParseError> {
    let ok = !name.is_empty()
        && name.len() <= MAX_IMAGE_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok {
        Ok(())
    } else {
        Err(ParseError::InvalidImageName(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn seed_names() {
        assert_eq!(
            seed_image_name(Arch::X64, BaseImage::Noble),
            "image-builder-base-noble-x64"
        );
        assert_eq!(
            seed_image_name(Arch::Arm64, BaseImage::Jammy),
            "image-builder-base-jammy-arm64"
        );
    }

    #[test]
    fn seed_ids_are_deterministic_per_generation() {
        let a = seed_image_id(Arch::X64, BaseImage::Noble, 1);
        assert_eq!(a, seed_image_id(Arch::X64, BaseImage::Noble, 1));
        assert_ne!(a, seed_image_id(Arch::X64, BaseImage::Noble, 2));
        assert_ne!(a, seed_image_id(Arch::Arm64, BaseImage::Noble, 1));
        assert_ne!(a, seed_image_id(Arch::X64, BaseImage::Jammy, 1));
    }

    #[test]
    fn builder_name_has_run_suffix() {
        let run = Uuid::from_u128(0xabcdef01_2345_6789_abcd_ef0123456789);
        assert_eq!(
            builder_name(Arch::X64, BaseImage::Jammy, &run),
            "image-builder-jammy-x64-abcdef01"
        );
    }

    #[test]
    fn revision_suffix_sorts_by_time() {
        let t1 = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let t2 = t1 + chrono::Duration::milliseconds(7);
        let a = revision_suffix(t1, "ffffff");
        let b = revision_suffix(t2, "000000");
        assert_eq!(a, "20240102T030405000Z-ffffff");
        assert!(a < b);
        assert_eq!(new_revision_suffix(t1).len(), a.len());
    }

    #[test]
    fn family_names() {
        assert!(validate_family_name("jammy-x64").is_ok());
        assert!(validate_family_name("runner_v1.2").is_ok());
        assert!(validate_family_name("").is_err());
        assert!(validate_family_name("bad name").is_err());
        assert!(validate_family_name(&"a".repeat(201)).is_err());
    }
}
