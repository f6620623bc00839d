mod common;

use common::{input, manager, pipeline, png_bytes, sgd_config};
use scanserve_core::{predict, training::FeedbackEvent, Error};
use uuid::Uuid;

fn fine_tune_once(manager: &std::sync::Arc<scanserve_core::ModelStateManager>, label: &str) -> u64 {
    let event = FeedbackEvent {
        prediction_id: Uuid::new_v4(),
        correct_label: label.to_string(),
        image_bytes: png_bytes(7),
    };
    pipeline(manager, sgd_config()).process(&event).unwrap().new_version
}

#[test]
fn test_second_checkout_is_busy_and_leaves_first_intact() {
    let manager = manager();
    let first = manager.begin_fine_tune().unwrap();
    let lease = first.lease();

    match manager.begin_fine_tune() {
        Err(Error::Busy { active_lease }) => assert_eq!(active_lease, lease),
        other => panic!("expected Busy, got {:?}", other),
    }
    assert!(manager.is_fine_tune_active());

    let snapshot = manager.commit(first).unwrap();
    assert_eq!(snapshot.version(), 2);
    assert!(!manager.is_fine_tune_active());
    assert!(manager.begin_fine_tune().is_ok());
}

#[test]
fn test_dropping_working_copy_releases_slot() {
    let manager = manager();
    {
        let _working = manager.begin_fine_tune().unwrap();
        assert!(manager.is_fine_tune_active());
    }
    assert!(!manager.is_fine_tune_active());
    assert_eq!(manager.current_version(), 1);
}

#[test]
fn test_commit_from_foreign_manager_rejected() {
    let ours = manager();
    let theirs = manager();
    let foreign = theirs.begin_fine_tune().unwrap();
    let lease = foreign.lease();

    assert!(matches!(
        ours.commit(foreign),
        Err(Error::StaleWorkingCopy { lease: l }) if l == lease
    ));
    assert_eq!(ours.current_version(), 1);
    // The rejected copy was dropped, which frees the other manager
    assert!(!theirs.is_fine_tune_active());
}

#[test]
fn test_abort_publishes_nothing() {
    let manager = manager();
    let before = manager.current_snapshot();
    let working = manager.begin_fine_tune().unwrap();
    manager.abort(working);

    let after = manager.current_snapshot();
    assert_eq!(after.version(), 1);
    assert!(std::sync::Arc::ptr_eq(&before, &after));
    assert_eq!(manager.previous_version(), None);
}

#[test]
fn test_rollback_restores_previous_parameters_as_new_version() {
    let manager = manager();
    assert!(matches!(manager.rollback(), Err(Error::NoPreviousSnapshot)));
    assert!(!manager.is_fine_tune_active());

    let x = input(7);
    let v1 = predict(&manager.current_snapshot(), &x).unwrap();
    assert_eq!(fine_tune_once(&manager, "C"), 2);
    let v2 = predict(&manager.current_snapshot(), &x).unwrap();

    let restored = manager.rollback().unwrap();
    assert_eq!(restored.version(), 3);
    assert_eq!(manager.previous_version(), Some(2));
    let v3 = predict(&restored, &x).unwrap();
    assert_eq!(v3.snapshot_version, 3);
    assert_eq!(v3.distribution, v1.distribution);
    assert_ne!(v3.distribution, v2.distribution);

    // The next commit builds on the restored parameters
    assert_eq!(fine_tune_once(&manager, "C"), 4);
}

#[test]
fn test_rollback_blocked_during_fine_tune() {
    let manager = manager();
    fine_tune_once(&manager, "A");
    let working = manager.begin_fine_tune().unwrap();
    assert!(matches!(manager.rollback(), Err(Error::Busy { .. })));
    manager.abort(working);
    assert_eq!(manager.rollback().unwrap().version(), 3);
}
