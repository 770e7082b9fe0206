use std::fmt::Display;

use burn::tensor::{backend::Backend, Float, Int, Tensor};

use crate::error::{RecognizerError, Result};

/// Accuracy is reported as top-1 and top-5, capped by the number of classes.
pub const TOP_K: usize = 5;

/// Loss and accuracy of one batch, as produced by `Head::loss`.
#[derive(Debug, Clone)]
pub struct LossMetrics<B: Backend> {
    pub loss: Tensor<B, 1, Float>,
    pub top1: f32,
    pub top5: f32,
}

impl<B: Backend> LossMetrics<B> {
    pub fn loss_value(&self) -> f32 {
        self.loss.to_data().convert::<f32>().value[0]
    }
}

impl<B: Backend> Display for LossMetrics<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "loss={:.4} top1={:.4} top5={:.4}", self.loss_value(), self.top1, self.top5)
    }
}

/// Fraction of rows whose label is among the `k` highest scores.
///
/// A label counts as a hit when fewer than `k` classes score strictly higher.
pub fn topk_accuracy<B: Backend>(scores: Tensor<B, 2>, labels: Tensor<B, 1, Int>, k: usize) -> Result<f32> {
    let [rows, num_classes] = scores.dims();
    let values = scores.into_data().convert::<f32>().value;
    let labels = labels.into_data().convert::<i64>().value;

    let hits = topk_hits(&values, num_classes, &labels, k)?;
    if rows == 0 {
        return Ok(0.0);
    }
    Ok(hits as f32 / rows as f32)
}

pub(crate) fn topk_hits(values: &[f32], num_classes: usize, labels: &[i64], k: usize) -> Result<usize> {
    let rows = if num_classes == 0 { 0 } else { values.len() / num_classes };
    if rows != labels.len() {
        return Err(RecognizerError::BatchMismatch { scores: rows, labels: labels.len() });
    }
    let k = k.min(num_classes);

    let mut hits = 0;
    for (row, &label) in values.chunks(num_classes).zip(labels) {
        let class = checked_label(label, num_classes)?;
        let target = row[class];
        let higher = row.iter().filter(|&&score| score > target).count();
        if higher < k {
            hits += 1;
        }
    }
    Ok(hits)
}

pub(crate) fn checked_label(label: i64, num_classes: usize) -> Result<usize> {
    if label < 0 || label as usize >= num_classes {
        return Err(RecognizerError::LabelOutOfRange { label, num_classes });
    }
    Ok(label as usize)
}

/// Running accuracy over a sequence of test batches, weighted by batch size.
#[derive(Debug, Default, Clone)]
pub struct AccuracyAccumulator {
    samples: usize,
    top1_hits: f64,
    top5_hits: f64,
}

impl AccuracyAccumulator {
    pub fn update(&mut self, top1: f32, top5: f32, batch_size: usize) {
        self.samples += batch_size;
        self.top1_hits += top1 as f64 * batch_size as f64;
        self.top5_hits += top5 as f64 * batch_size as f64;
    }

    pub fn samples(&self) -> usize {
        self.samples
    }

    /// `(top1, top5)` over everything seen so far.
    pub fn accuracy(&self) -> (f32, f32) {
        if self.samples == 0 {
            return (0.0, 0.0);
        }
        let n = self.samples as f64;
        ((self.top1_hits / n) as f32, (self.top5_hits / n) as f32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_hits_within_k() {
        let values = [
            0.1, 0.7, 0.2, // label 1 -> top1
            0.5, 0.3, 0.2, // label 1 -> top2
            0.6, 0.3, 0.1, // label 2 -> top3
        ];
        let labels = [1, 1, 2];

        assert_eq!(topk_hits(&values, 3, &labels, 1).unwrap(), 1);
        assert_eq!(topk_hits(&values, 3, &labels, 2).unwrap(), 2);
        assert_eq!(topk_hits(&values, 3, &labels, 5).unwrap(), 3);
    }

    #[test]
    fn rejects_labels_outside_class_range() {
        let err = topk_hits(&[0.5, 0.5], 2, &[2], 1).unwrap_err();
        assert!(matches!(err, RecognizerError::LabelOutOfRange { label: 2, num_classes: 2 }));
    }

    #[test]
    fn rejects_row_count_mismatch() {
        let err = topk_hits(&[0.5, 0.5], 2, &[0, 1], 1).unwrap_err();
        assert!(matches!(err, RecognizerError::BatchMismatch { scores: 1, labels: 2 }));
    }

    #[test]
    fn accumulator_weights_by_batch_size() {
        let mut acc = AccuracyAccumulator::default();
        acc.update(1.0, 1.0, 3);
        acc.update(0.0, 1.0, 1);

        assert_eq!(acc.samples(), 4);
        assert_eq!(acc.accuracy(), (0.75, 1.0));
    }
}
