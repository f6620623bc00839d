mod common;

use std::sync::Arc;

use common::{input, manager, preprocessor, snapshot};
use image::{Rgb, RgbImage};
use scanserve_core::{
    evaluate,
    evaluation::{ImageFolderDataset, InMemoryDataset},
    predict, Error,
};

fn dataset(n: u8) -> InMemoryDataset {
    let mut dataset = InMemoryDataset::default();
    for i in 0..n {
        dataset.push(input(i.wrapping_mul(13)), (i % 4) as usize);
    }
    dataset
}

#[test]
fn test_empty_dataset_rejected_without_side_effects() {
    let manager = manager();
    let before = manager.current_snapshot();
    let result = evaluate(&before, &InMemoryDataset::default(), 16);
    assert!(matches!(result, Err(Error::EmptyDataset)));
    assert_eq!(manager.current_version(), 1);
    assert!(!manager.is_fine_tune_active());
    assert!(Arc::ptr_eq(&before, &manager.current_snapshot()));
}

#[test]
fn test_report_covers_every_class() {
    let snapshot = snapshot(4);
    let report = evaluate(&snapshot, &dataset(10), 3).unwrap();

    assert_eq!(report.snapshot_version, 4);
    assert_eq!(report.sample_count, 10);
    assert_eq!(report.per_class.len(), 4);
    assert_eq!(report.per_class["A"].support, 3);
    assert_eq!(report.per_class["D"].support, 2);
    for value in [
        report.overall_accuracy,
        report.overall_precision_weighted,
        report.overall_recall_weighted,
        report.overall_f1_weighted,
    ] {
        assert!((0.0..=1.0).contains(&value));
    }
    // Weighted recall equals accuracy when weights are true-label support
    assert!((report.overall_recall_weighted - report.overall_accuracy).abs() < 1e-9);
}

#[test]
fn test_batch_size_does_not_change_result() {
    let snapshot = snapshot(1);
    let data = dataset(9);
    let one = evaluate(&snapshot, &data, 1).unwrap();
    let many = evaluate(&snapshot, &data, 16).unwrap();
    assert_eq!(one.overall_accuracy, many.overall_accuracy);
    assert_eq!(one.per_class, many.per_class);
}

#[test]
fn test_accuracy_matches_individual_predictions() {
    let snapshot = snapshot(1);
    let data = dataset(8);
    let correct = (0..8u8)
        .filter(|&i| predict(&snapshot, &input(i.wrapping_mul(13))).unwrap().predicted_index == (i % 4) as usize)
        .count();
    let report = evaluate(&snapshot, &data, 4).unwrap();
    assert!((report.overall_accuracy - correct as f64 / 8.0).abs() < 1e-9);
}

#[test]
fn test_out_of_range_label_is_dataset_error() {
    let snapshot = snapshot(1);
    let mut data = InMemoryDataset::default();
    data.push(input(1), 9);
    assert!(matches!(evaluate(&snapshot, &data, 4), Err(Error::Dataset(_))));
}

#[test]
fn test_image_folder_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    for (class, shade) in [("A", 20u8), ("B", 90), ("C", 160), ("D", 230)] {
        let class_dir = dir.path().join(class);
        std::fs::create_dir_all(&class_dir).unwrap();
        for i in 0..2u8 {
            RgbImage::from_fn(20, 20, |x, _| Rgb([shade, shade.wrapping_add(i), x as u8]))
                .save(class_dir.join(format!("{}.png", i)))
                .unwrap();
        }
    }

    let snapshot = snapshot(1);
    let dataset = ImageFolderDataset::open(dir.path(), snapshot.classes(), preprocessor()).unwrap();
    let report = evaluate(&snapshot, &dataset, 3).unwrap();
    assert_eq!(report.sample_count, 8);
    assert!(report.per_class.values().all(|m| m.support == 2));
}
