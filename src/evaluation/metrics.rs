//! Confusion-matrix classification metrics.

use serde::{Deserialize, Serialize};

/// Precision, recall and F1 for one class
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassMetrics {
    pub precision: f64,
    pub recall: f64,
    pub f1_score: f64,
    /// Number of samples whose true label is this class
    pub support: usize,
}

/// Square confusion matrix, rows are true labels and columns predictions
#[derive(Debug, Clone, PartialEq)]
pub struct ConfusionMatrix {
    num_classes: usize,
    counts: Vec<usize>,
}

impl ConfusionMatrix {
    pub fn new(num_classes: usize) -> Self {
        Self {
            num_classes,
            counts: vec![0; num_classes * num_classes],
        }
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Record one sample; out-of-range indices are ignored
    pub fn record(&mut self, actual: usize, predicted: usize) {
        if actual < self.num_classes && predicted < self.num_classes {
            self.counts[actual * self.num_classes + predicted] += 1;
        }
    }

    pub fn count(&self, actual: usize, predicted: usize) -> usize {
        self.counts[actual * self.num_classes + predicted]
    }

    pub fn total(&self) -> usize {
        self.counts.iter().sum()
    }

    pub fn true_positives(&self, class: usize) -> usize {
        self.count(class, class)
    }

    pub fn false_positives(&self, class: usize) -> usize {
        (0..self.num_classes)
            .filter(|&actual| actual != class)
            .map(|actual| self.count(actual, class))
            .sum()
    }

    pub fn false_negatives(&self, class: usize) -> usize {
        (0..self.num_classes)
            .filter(|&predicted| predicted != class)
            .map(|predicted| self.count(class, predicted))
            .sum()
    }

    pub fn support(&self, class: usize) -> usize {
        (0..self.num_classes).map(|p| self.count(class, p)).sum()
    }

    pub fn accuracy(&self) -> f64 {
        let correct: usize = (0..self.num_classes).map(|c| self.true_positives(c)).sum();
        ratio(correct, self.total())
    }

    pub fn class_metrics(&self, class: usize) -> ClassMetrics {
        let tp = self.true_positives(class);
        let fp = self.false_positives(class);
        let fn_ = self.false_negatives(class);
        ClassMetrics {
            precision: ratio(tp, tp + fp),
            recall: ratio(tp, tp + fn_),
            f1_score: ratio(2 * tp, 2 * tp + fp + fn_),
            support: tp + fn_,
        }
    }

    /// Support-weighted average of precision, recall and F1
    pub fn weighted(&self) -> (f64, f64, f64) {
        let total = self.total();
        if total == 0 {
            return (0.0, 0.0, 0.0);
        }
        let mut sums = (0.0, 0.0, 0.0);
        for class in 0..self.num_classes {
            let m = self.class_metrics(class);
            let w = m.support as f64;
            sums.0 += m.precision * w;
            sums.1 += m.recall * w;
            sums.2 += m.f1_score * w;
        }
        let total = total as f64;
        (sums.0 / total, sums.1 / total, sums.2 / total)
    }
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}
