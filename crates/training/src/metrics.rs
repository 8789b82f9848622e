use std::cmp::Ordering;

use crate::TrainingError;

/// Streaming area under the ROC curve over every item seen so far.
#[derive(Debug, Clone, Default)]
pub struct AucMetrics {
    samples: Vec<(f32, bool)>,
}

impl AucMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Labels above zero count as positives.
    pub fn add(&mut self, labels: &[i64], scores: &[f32]) -> Result<(), TrainingError> {
        if labels.len() != scores.len() {
            return Err(TrainingError::runtime(format!(
                "auc got {} label(s) for {} score(s)",
                labels.len(),
                scores.len()
            )));
        }
        self.samples.extend(
            scores
                .iter()
                .zip(labels)
                .map(|(&score, &label)| (score, label > 0)),
        );
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Mann-Whitney statistic with average ranks for tied scores.
    /// 0.5 when either class is absent.
    pub fn overall_auc(&self) -> f64 {
        let positives = self.samples.iter().filter(|(_, positive)| *positive).count();
        let negatives = self.samples.len() - positives;
        if positives == 0 || negatives == 0 {
            return 0.5;
        }

        let mut sorted = self.samples.clone();
        sorted.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal));

        let mut positive_rank_sum = 0.0f64;
        let mut start = 0;
        while start < sorted.len() {
            let mut end = start + 1;
            while end < sorted.len() && sorted[end].0 == sorted[start].0 {
                end += 1;
            }
            // ranks are 1-based; the tie group [start, end) shares their mean
            let average_rank = (start + 1 + end) as f64 / 2.0;
            let group_positives = sorted[start..end].iter().filter(|(_, p)| *p).count();
            positive_rank_sum += average_rank * group_positives as f64;
            start = end;
        }

        let p = positives as f64;
        let n = negatives as f64;
        (positive_rank_sum - p * (p + 1.0) / 2.0) / (p * n)
    }
}

fn check_sequences(
    kind: &str,
    labels: &[Vec<f32>],
    preds: &[Vec<f32>],
) -> Result<(), TrainingError> {
    if labels.len() != preds.len() {
        return Err(TrainingError::runtime(format!(
            "{kind} got {} label sequence(s) for {} prediction sequence(s)",
            labels.len(),
            preds.len()
        )));
    }
    for (index, (label, pred)) in labels.iter().zip(preds).enumerate() {
        if label.len() != pred.len() {
            return Err(TrainingError::runtime(format!(
                "{kind}: sequence {index} has {} label(s) and {} prediction(s)",
                label.len(),
                pred.len()
            )));
        }
    }
    Ok(())
}

/// Mean over sequences of the per-sequence root mean squared error.
#[derive(Debug, Clone, Default)]
pub struct SequenceRmseMetrics {
    total: f64,
    sequences: usize,
}

impl SequenceRmseMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, labels: &[Vec<f32>], preds: &[Vec<f32>]) -> Result<(), TrainingError> {
        check_sequences("seq_rmse", labels, preds)?;
        for (label, pred) in labels.iter().zip(preds) {
            if label.is_empty() {
                continue;
            }
            let squared: f64 = label
                .iter()
                .zip(pred)
                .map(|(&l, &p)| {
                    let diff = f64::from(l) - f64::from(p);
                    diff * diff
                })
                .sum();
            self.total += (squared / label.len() as f64).sqrt();
            self.sequences += 1;
        }
        Ok(())
    }

    pub fn overall_rmse(&self) -> f64 {
        if self.sequences == 0 {
            0.0
        } else {
            self.total / self.sequences as f64
        }
    }
}

/// Mean over sequences of the per-sequence Pearson correlation.
///
/// Sequences shorter than two items, or with a constant label or prediction,
/// have no defined correlation and are left out of the mean.
#[derive(Debug, Clone, Default)]
pub struct SequenceCorrelationMetrics {
    total: f64,
    sequences: usize,
    skipped: usize,
}

impl SequenceCorrelationMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, labels: &[Vec<f32>], preds: &[Vec<f32>]) -> Result<(), TrainingError> {
        check_sequences("seq_correlation", labels, preds)?;
        for (label, pred) in labels.iter().zip(preds) {
            match pearson(label, pred) {
                Some(value) => {
                    self.total += value;
                    self.sequences += 1;
                }
                None => self.skipped += 1,
            }
        }
        Ok(())
    }

    pub fn skipped_sequences(&self) -> usize {
        self.skipped
    }

    pub fn overall_correlation(&self) -> f64 {
        if self.sequences == 0 {
            0.0
        } else {
            self.total / self.sequences as f64
        }
    }
}

fn pearson(xs: &[f32], ys: &[f32]) -> Option<f64> {
    if xs.len() < 2 {
        return None;
    }
    let n = xs.len() as f64;
    let mean_x = xs.iter().map(|&x| f64::from(x)).sum::<f64>() / n;
    let mean_y = ys.iter().map(|&y| f64::from(y)).sum::<f64>() / n;

    let mut cov = 0.0;
    let mut var_x = 0.0;
    let mut var_y = 0.0;
    for (&x, &y) in xs.iter().zip(ys) {
        let dx = f64::from(x) - mean_x;
        let dy = f64::from(y) - mean_y;
        cov += dx * dy;
        var_x += dx * dx;
        var_y += dy * dy;
    }
    if var_x <= f64::EPSILON || var_y <= f64::EPSILON {
        return None;
    }
    Some(cov / (var_x.sqrt() * var_y.sqrt()))
}
