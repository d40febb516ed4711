mod common;

use common::{cloud_config, image_config, Harness, FAMILY};
use runner_image_common::naming::{FAMILY_PROPERTY, REVISION_PROPERTY};
use runner_image_common::ImageStatus;
use runner_image_orchestrator::snapshot::{list_revisions, rotate};
use runner_image_orchestrator::RunOptions;
use runner_image_providers::mock::MockBehavior;
use std::collections::{BTreeMap, HashSet};

fn keep(k: u32) -> RunOptions {
    RunOptions {
        keep_revisions: k,
        skip_bootstrap: false,
    }
}

fn revision_props(family: &str, revision: &str) -> BTreeMap<String, String> {
    let mut props = BTreeMap::new();
    props.insert(FAMILY_PROPERTY.to_string(), family.to_string());
    props.insert(REVISION_PROPERTY.to_string(), revision.to_string());
    props
}

#[tokio::test]
async fn sequential_runs_keep_the_newest_revisions() {
    let h = Harness::new();
    let builder = h.builder();
    let mut ids = Vec::new();
    for _ in 0..3 {
        let outcome = builder
            .build(&cloud_config(), &image_config(), keep(2))
            .await
            .unwrap();
        ids.push(outcome.artifact_id);
    }

    let remaining = list_revisions(&h.cloud, FAMILY).await.unwrap();
    let remaining: Vec<String> = remaining.into_iter().map(|r| r.id).collect();
    assert_eq!(remaining, vec![ids[2].clone(), ids[1].clone()]);
}

#[tokio::test]
async fn keep_zero_still_keeps_the_new_revision() {
    let h = Harness::new();
    let builder = h.builder();
    builder
        .build(&cloud_config(), &image_config(), keep(0))
        .await
        .unwrap();
    let outcome = builder
        .build(&cloud_config(), &image_config(), keep(0))
        .await
        .unwrap();

    let remaining = list_revisions(&h.cloud, FAMILY).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, outcome.artifact_id);
    assert_eq!(outcome.rotation.deleted.len(), 1);
}

#[tokio::test]
async fn fewer_revisions_than_keep_deletes_nothing() {
    let h = Harness::new();
    let builder = h.builder();
    for _ in 0..2 {
        let outcome = builder
            .build(&cloud_config(), &image_config(), keep(5))
            .await
            .unwrap();
        assert!(outcome.rotation.deleted.is_empty());
    }
    assert_eq!(list_revisions(&h.cloud, FAMILY).await.unwrap().len(), 2);
    assert_eq!(h.cloud.call_count("delete_image"), 0);
}

#[tokio::test]
async fn failed_delete_is_a_warning_not_an_error() {
    let h = Harness::new();
    let old = h
        .cloud
        .insert_image("runner-noble-old", ImageStatus::Active, revision_props(FAMILY, "old"));
    let mut behavior = MockBehavior::default();
    behavior.failing_image_deletes = HashSet::from([old.id.clone()]);
    h.cloud.set_behavior(behavior);

    let outcome = h
        .builder()
        .build(&cloud_config(), &image_config(), keep(1))
        .await
        .unwrap();

    assert_eq!(outcome.rotation.warnings.len(), 1);
    assert_eq!(outcome.rotation.warnings[0].image_id, old.id);
    assert!(h.cloud.images().iter().any(|i| i.id == old.id));
}

#[tokio::test]
async fn images_outside_the_family_are_never_rotated() {
    let h = Harness::new();
    let other = h.cloud.insert_image(
        "runner-jammy-1",
        ImageStatus::Active,
        revision_props("runner-jammy", "1"),
    );
    let mut no_revision = BTreeMap::new();
    no_revision.insert(FAMILY_PROPERTY.to_string(), FAMILY.to_string());
    let untagged = h
        .cloud
        .insert_image("runner-noble-manual", ImageStatus::Active, no_revision);
    let queued = h.cloud.insert_image(
        "runner-noble-queued",
        ImageStatus::Queued,
        revision_props(FAMILY, "0"),
    );

    h.builder()
        .build(&cloud_config(), &image_config(), keep(1))
        .await
        .unwrap();

    let ids: HashSet<String> = h.cloud.images().into_iter().map(|i| i.id).collect();
    assert!(ids.contains(&other.id));
    assert!(ids.contains(&untagged.id));
    assert!(ids.contains(&queued.id));
}

#[tokio::test]
async fn rotate_ranks_by_creation_time() {
    let h = Harness::new();
    let a = h
        .cloud
        .insert_image("fam-a", ImageStatus::Active, revision_props("fam", "zzz"));
    let b = h
        .cloud
        .insert_image("fam-b", ImageStatus::Active, revision_props("fam", "aaa"));
    let c = h
        .cloud
        .insert_image("fam-c", ImageStatus::Active, revision_props("fam", "mmm"));

    let report = rotate(&h.cloud, "fam", 2, &c.id).await;
    let kept: Vec<&str> = report.kept.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(kept, vec![c.id.as_str(), b.id.as_str()]);
    assert_eq!(report.deleted.len(), 1);
    assert_eq!(report.deleted[0].id, a.id);
    assert!(report.warnings.is_empty());
}
