//! Matching predicted detections against ground truth.

use std::collections::BTreeMap;

use emitfit_core::{DetectionRecord, DetectionSet};
use serde::{Deserialize, Serialize};

/// Detection quality of one evaluation pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchStats {
    pub matched: usize,
    pub predicted: usize,
    pub ground_truth: usize,
    pub precision: f64,
    pub recall: f64,
    pub jaccard: f64,
    /// Root mean squared lateral distance of matched pairs, in pixels.
    pub rmse_lateral: f64,
    /// Root mean squared axial distance of matched pairs; 0 for 2D sets.
    pub rmse_axial: f64,
}

/// Greedy nearest-neighbour matching within `radius`, frame by frame.
///
/// Candidate pairs are taken in order of increasing lateral distance and
/// each prediction and ground-truth record is used at most once.
pub fn match_detections(predicted: &DetectionSet, truth: &DetectionSet, radius: f32) -> MatchStats {
    let radius_sq = radius * radius;
    let axial = predicted.dim() == 3 && truth.dim() == 3;

    let mut matched = 0usize;
    let mut lateral_sq = 0.0f64;
    let mut axial_sq = 0.0f64;

    let mut truth_by_frame = by_frame(truth);
    for (frame, preds) in by_frame(predicted) {
        let Some(gts) = truth_by_frame.remove(&frame) else {
            continue;
        };

        let mut candidates = Vec::new();
        for (i, p) in preds.iter().enumerate() {
            for (j, g) in gts.iter().enumerate() {
                let dx = p.xyz[0] - g.xyz[0];
                let dy = p.xyz[1] - g.xyz[1];
                let d = dx * dx + dy * dy;
                if d <= radius_sq {
                    candidates.push((d, i, j));
                }
            }
        }
        candidates.sort_by(|a, b| a.0.total_cmp(&b.0));

        let mut pred_used = vec![false; preds.len()];
        let mut gt_used = vec![false; gts.len()];
        for (d, i, j) in candidates {
            if pred_used[i] || gt_used[j] {
                continue;
            }
            pred_used[i] = true;
            gt_used[j] = true;
            matched += 1;
            lateral_sq += f64::from(d);
            if axial {
                let dz = f64::from(preds[i].xyz[2] - gts[j].xyz[2]);
                axial_sq += dz * dz;
            }
        }
    }

    let predicted_count = predicted.len();
    let truth_count = truth.len();
    let ratio = |num: usize, den: usize| if den == 0 { 0.0 } else { num as f64 / den as f64 };
    let rms = |sum: f64| if matched == 0 { 0.0 } else { (sum / matched as f64).sqrt() };

    MatchStats {
        matched,
        predicted: predicted_count,
        ground_truth: truth_count,
        precision: ratio(matched, predicted_count),
        recall: ratio(matched, truth_count),
        jaccard: ratio(matched, predicted_count + truth_count - matched),
        rmse_lateral: rms(lateral_sq),
        rmse_axial: rms(axial_sq),
    }
}

/// Records grouped by frame, in record order within each frame.
fn by_frame(set: &DetectionSet) -> BTreeMap<usize, Vec<&DetectionRecord>> {
    let mut frames: BTreeMap<usize, Vec<&DetectionRecord>> = BTreeMap::new();
    for record in set.iter() {
        frames.entry(record.frame).or_default().push(record);
    }
    frames
}
