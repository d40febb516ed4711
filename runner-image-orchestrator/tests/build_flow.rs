mod common;

use common::{cloud_config, image_config, Harness, CLOUD, FAMILY};
use runner_image_common::naming::FAMILY_PROPERTY;
use runner_image_common::{FlavorSelection, FlavorSizing, FlavorSpec, ImageStatus};
use runner_image_orchestrator::{BuildError, RunOptions};
use runner_image_providers::mock::{MockBehavior, MockBuildSignal, MockProvider, MockSnapshotOutcome};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn family_images(cloud: &MockProvider) -> Vec<runner_image_providers::inventory::Image> {
    cloud.images_with_property(FAMILY_PROPERTY, FAMILY)
}

#[tokio::test]
async fn successful_build_produces_an_active_revision() {
    let h = Harness::new();
    let outcome = h
        .builder()
        .build(&cloud_config(), &image_config(), RunOptions::default())
        .await
        .unwrap();

    assert_eq!(outcome.artifact_id, outcome.revision.id);
    assert!(outcome.published.is_none());
    assert!(outcome.revision.name.starts_with(FAMILY));
    let images = family_images(&h.cloud);
    assert_eq!(images.len(), 1);
    assert_eq!(images[0].status, ImageStatus::Active);
    assert_eq!(images[0].id, outcome.artifact_id);

    // The builder VM is gone, deleted exactly once.
    assert!(h.cloud.servers().is_empty());
    assert_eq!(h.cloud.deleted_servers().len(), 1);
    assert_eq!(h.cloud.call_count("delete_server"), 1);
}

#[tokio::test]
async fn builder_vm_uses_shared_resources_and_run_token() {
    let h = Harness::with_behavior(MockBehavior {
        build_signal: MockBuildSignal::Never,
        ..MockBehavior::default()
    });
    let builder = h.builder();
    let cancel = CancellationToken::new();
    let builder = builder.with_cancellation(cancel.clone());
    let cloud = h.cloud.clone();
    let watcher = tokio::spawn(async move {
        loop {
            if let Some(server) = cloud.servers().into_iter().next() {
                cancel.cancel();
                return server;
            }
            tokio::task::yield_now().await;
        }
    });
    let err = builder
        .build(&cloud_config(), &image_config(), RunOptions::default())
        .await
        .unwrap_err();
    let server = watcher.await.unwrap();

    assert!(matches!(err, BuildError::Cancelled));
    let groups = h.cloud.security_groups();
    assert_eq!(server.security_groups, vec![groups[0].id.clone()]);
    assert_eq!(server.key_name.as_deref(), Some("image-builder-ssh-key"));
    assert!(server.metadata.contains_key("image_builder_run"));
    assert!(h.cloud.servers().is_empty());
}

#[tokio::test(start_paused = true)]
async fn build_timeout_deletes_the_vm_exactly_once() {
    let h = Harness::with_behavior(MockBehavior {
        build_signal: MockBuildSignal::Never,
        ..MockBehavior::default()
    });
    let err = h
        .builder()
        .build(&cloud_config(), &image_config(), RunOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, BuildError::BuildTimeout { .. }), "{err}");
    assert_eq!(err.category(), "build-timeout");
    assert_eq!(h.cloud.call_count("delete_server"), 1);
    assert!(h.cloud.servers().is_empty());
    assert!(family_images(&h.cloud).is_empty());
}

#[tokio::test]
async fn failure_marker_aborts_with_the_reason() {
    let h = Harness::with_behavior(MockBehavior {
        build_signal: MockBuildSignal::Failure {
            reason: "apt-get install failed".to_string(),
        },
        ..MockBehavior::default()
    });
    let err = h
        .builder()
        .build(&cloud_config(), &image_config(), RunOptions::default())
        .await
        .unwrap_err();

    match &err {
        BuildError::BuildFailed { reason, .. } => assert!(reason.contains("apt-get")),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(h.cloud.call_count("delete_server"), 1);
    assert_eq!(h.cloud.call_count("create_server_snapshot"), 0);
}

#[tokio::test(start_paused = true)]
async fn vm_stuck_in_build_times_out_and_is_deleted() {
    let h = Harness::with_behavior(MockBehavior {
        server_stuck: true,
        ..MockBehavior::default()
    });
    let err = h
        .builder()
        .build(&cloud_config(), &image_config(), RunOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, BuildError::LaunchTimeout { .. }), "{err}");
    assert_eq!(h.cloud.call_count("delete_server"), 1);
    assert!(h.cloud.servers().is_empty());
}

#[tokio::test]
async fn vm_in_error_state_is_deleted() {
    let h = Harness::with_behavior(MockBehavior {
        server_error: true,
        ..MockBehavior::default()
    });
    let err = h
        .builder()
        .build(&cloud_config(), &image_config(), RunOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err.category(), "launch");
    assert!(err.to_string().contains("ERROR"));
    assert!(h.cloud.servers().is_empty());
}

#[tokio::test]
async fn create_failure_leaves_no_vm() {
    let h = Harness::with_behavior(MockBehavior {
        fail_create_server: true,
        ..MockBehavior::default()
    });
    let err = h
        .builder()
        .build(&cloud_config(), &image_config(), RunOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, BuildError::Launch(_)), "{err}");
    assert!(h.cloud.servers().is_empty());
    assert_eq!(h.cloud.call_count("delete_server"), 0);
}

#[tokio::test(start_paused = true)]
async fn stuck_snapshot_fails_after_the_vm_is_deleted() {
    let h = Harness::with_behavior(MockBehavior {
        snapshot_outcome: MockSnapshotOutcome::Stuck,
        ..MockBehavior::default()
    });
    let err = h
        .builder()
        .build(&cloud_config(), &image_config(), RunOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, BuildError::Snapshot(_)), "{err}");
    assert!(h.cloud.servers().is_empty());
    assert_eq!(h.cloud.call_count("delete_server"), 1);
    // The half-saved image is not left behind as a revision.
    assert!(family_images(&h.cloud).is_empty());
}

#[tokio::test]
async fn killed_snapshot_is_a_snapshot_error() {
    let h = Harness::with_behavior(MockBehavior {
        snapshot_outcome: MockSnapshotOutcome::Killed,
        ..MockBehavior::default()
    });
    let err = h
        .builder()
        .build(&cloud_config(), &image_config(), RunOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.category(), "snapshot");
    assert!(h.cloud.servers().is_empty());
}

#[tokio::test]
async fn declared_flavor_below_minimum_fails_before_any_cloud_call() {
    let h = Harness::new();
    let mut cc = cloud_config();
    cc.flavor = FlavorSelection::Declared(FlavorSpec {
        name: "m1.small".to_string(),
        sizing: FlavorSizing {
            vcpus: 1,
            ram_mib: 2048,
            disk_gib: 10,
        },
    });
    let err = h
        .builder()
        .build(&cc, &image_config(), RunOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, BuildError::Configuration(_)), "{err}");
    assert_eq!(h.cloud.total_calls(), 0);
}

#[tokio::test]
async fn named_flavor_too_small_is_a_configuration_error() {
    let h = Harness::new();
    let mut cc = cloud_config();
    cc.flavor = FlavorSelection::Named("m1.small".to_string());
    let err = h
        .builder()
        .build(&cc, &image_config(), RunOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.category(), "configuration");
    assert_eq!(h.cloud.call_count("create_server"), 0);
}

#[tokio::test]
async fn cancelled_before_start_makes_no_cloud_calls() {
    let h = Harness::new();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = h
        .builder()
        .with_cancellation(cancel)
        .build(&cloud_config(), &image_config(), RunOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, BuildError::Cancelled));
    assert_eq!(h.cloud.total_calls(), 0);
}

#[tokio::test]
async fn publish_copies_the_revision_to_the_upload_cloud() {
    let h = Harness::new();
    let target = MockProvider::new("upload");
    let mut cc = cloud_config();
    cc.upload_cloud_name = Some("upload".to_string());
    let outcome = h
        .builder()
        .with_upload_cloud(Arc::new(target.clone()))
        .build(&cc, &image_config(), RunOptions::default())
        .await
        .unwrap();

    let published = outcome.published.expect("published revision");
    assert_eq!(outcome.artifact_id, published.id);
    assert_eq!(published.name, outcome.revision.name);
    let remote = family_images(&target);
    assert_eq!(remote.len(), 1);
    assert_eq!(remote[0].status, ImageStatus::Active);
    assert_eq!(family_images(&h.cloud).len(), 1);
}

#[tokio::test]
async fn upload_cloud_must_be_connected_when_configured() {
    let h = Harness::new();
    let mut cc = cloud_config();
    cc.upload_cloud_name = Some("upload".to_string());
    let err = h
        .builder()
        .build(&cc, &image_config(), RunOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.category(), "configuration");
    assert_eq!(h.cloud.total_calls(), 0);
}

#[tokio::test]
async fn latest_build_id_tracks_the_newest_revision() {
    let h = Harness::new();
    let builder = h.builder();
    assert_eq!(builder.latest_build_id(FAMILY).await.unwrap(), None);

    let first = builder
        .run(&cloud_config(), &image_config(), 5)
        .await
        .unwrap();
    assert_eq!(
        builder.latest_build_id(FAMILY).await.unwrap(),
        Some(first.clone())
    );
    let second = builder
        .run(&cloud_config(), &image_config(), 5)
        .await
        .unwrap();
    assert_ne!(first, second);
    assert_eq!(builder.latest_build_id(FAMILY).await.unwrap(), Some(second));
}

#[tokio::test]
async fn wrong_cloud_name_is_rejected() {
    let h = Harness::new();
    let mut cc = cloud_config();
    cc.cloud_name = format!("{}-other", CLOUD);
    let err = h
        .builder()
        .build(&cc, &image_config(), RunOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.category(), "configuration");
}

#[tokio::test(start_paused = true)]
async fn dropping_the_build_while_launching_deletes_the_vm() {
    let h = Harness::with_behavior(MockBehavior {
        server_stuck: true,
        ..MockBehavior::default()
    });
    let builder = h.builder();
    let abandoned = tokio::time::timeout(
        Duration::from_secs(5),
        builder.build(&cloud_config(), &image_config(), RunOptions::default()),
    )
    .await;
    assert!(abandoned.is_err(), "build should still be waiting for ACTIVE");
    assert_eq!(h.cloud.call_count("create_server"), 1);

    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
    assert!(h.cloud.servers().is_empty());
    assert_eq!(h.cloud.deleted_servers().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn transient_console_error_does_not_abort_the_build() {
    let h = Harness::with_behavior(MockBehavior {
        console_errors: 1,
        ..MockBehavior::default()
    });
    let outcome = h
        .builder()
        .build(&cloud_config(), &image_config(), RunOptions::default())
        .await
        .unwrap();

    assert_eq!(family_images(&h.cloud).len(), 1);
    assert_eq!(family_images(&h.cloud)[0].id, outcome.artifact_id);
    assert_eq!(h.cloud.call_count("get_console_output"), 2);
    assert!(h.cloud.servers().is_empty());
}

#[tokio::test(start_paused = true)]
async fn vm_entering_error_mid_build_fails_without_waiting_for_the_timeout() {
    let h = Harness::with_behavior(MockBehavior {
        build_signal: MockBuildSignal::Never,
        server_error_during_build: true,
        ..MockBehavior::default()
    });
    let started = tokio::time::Instant::now();
    let err = h
        .builder()
        .build(&cloud_config(), &image_config(), RunOptions::default())
        .await
        .unwrap_err();

    match &err {
        BuildError::BuildFailed { reason, .. } => assert!(reason.contains("ERROR"), "{reason}"),
        other => panic!("unexpected error: {other}"),
    }
    assert!(started.elapsed() < Duration::from_secs(120));
    assert_eq!(h.cloud.call_count("delete_server"), 1);
    assert!(h.cloud.servers().is_empty());
}
