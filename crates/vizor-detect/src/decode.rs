//! Raw detector head → filtered, deduplicated detections.
//!
//! The head is logically `[1, 4 + nc, anchors]`: rows 0..4 hold the box
//! centre and size in input-resolution units, the remaining rows one score
//! per class. Engines that hand back the transposed `[1, anchors, 4 + nc]`
//! tensor say so with [`TensorLayout::AnchorsFirst`]; the view is flipped
//! once up front and the loop below is shared.

use std::collections::BTreeSet;

use log::trace;
use ndarray::{ArrayView3, Axis};
use serde::{Deserialize, Serialize};

use crate::classes::class_label;
use crate::detection::{BBox, Detection};
use crate::{DetectError, Result};

/// Physical layout of a raw head tensor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TensorLayout {
    /// `[1, 4 + nc, anchors]`
    ChannelsFirst,
    /// `[1, anchors, 4 + nc]`
    AnchorsFirst,
}

/// Per-call thresholds and class filter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectParams {
    pub confidence: f32,
    pub iou: f32,
    /// Empty means every class is allowed.
    #[serde(default)]
    pub allowed_classes: BTreeSet<usize>,
}

impl Default for DetectParams {
    fn default() -> Self {
        Self { confidence: 0.5, iou: 0.45, allowed_classes: BTreeSet::new() }
    }
}

impl DetectParams {
    pub fn allows(&self, class_id: usize) -> bool {
        self.allowed_classes.is_empty() || self.allowed_classes.contains(&class_id)
    }
}

/// Decode one raw head.
///
/// `input_size` is the engine's square input side; `frame_size` is the
/// (width, height) of the frame before it was resized, which is the space
/// the returned boxes live in.
pub fn decode(
    output: ArrayView3<'_, f32>,
    layout: TensorLayout,
    input_size: u32,
    frame_size: (u32, u32),
    params: &DetectParams,
) -> Result<Vec<Detection>> {
    if output.len_of(Axis(0)) != 1 {
        return Err(DetectError::InvalidOutputShape(output.shape().to_vec()));
    }
    let head = output.index_axis(Axis(0), 0);
    let head = match layout {
        TensorLayout::ChannelsFirst => head,
        TensorLayout::AnchorsFirst => head.reversed_axes(),
    };
    let (rows, anchors) = head.dim();
    if rows < 5 {
        return Err(DetectError::InvalidOutputShape(output.shape().to_vec()));
    }

    let scale_x = frame_size.0 as f32 / input_size as f32;
    let scale_y = frame_size.1 as f32 / input_size as f32;

    let mut candidates = Vec::new();
    for i in 0..anchors {
        let column = head.column(i);

        // argmax, lower index wins ties; NaN never compares greater
        let mut class_id = 0;
        let mut max_score = f32::NEG_INFINITY;
        for j in 0..rows - 4 {
            let score = column[4 + j];
            if score > max_score {
                max_score = score;
                class_id = j;
            }
        }

        if max_score <= params.confidence || !params.allows(class_id) {
            continue;
        }

        let (cx, cy, w, h) = (column[0], column[1], column[2], column[3]);
        candidates.push(Detection {
            class_id,
            label: class_label(class_id),
            confidence: max_score,
            bbox: BBox::from_center(cx * scale_x, cy * scale_y, w * scale_x, h * scale_y),
        });
    }

    trace!("{} of {anchors} anchors above {:.2}", candidates.len(), params.confidence);
    Ok(non_max_suppression(candidates, params.iou))
}

/// Greedy NMS across all classes: keep the best remaining box, drop every
/// later box overlapping it by more than `iou_thr`.
pub fn non_max_suppression(mut dets: Vec<Detection>, iou_thr: f32) -> Vec<Detection> {
    dets.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<Detection> = Vec::with_capacity(dets.len());
    'outer: for d in dets {
        for k in &keep {
            if d.bbox.iou(&k.bbox) > iou_thr {
                continue 'outer;
            }
        }
        keep.push(d);
    }
    keep
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    /// Build a channels-first head from per-anchor (box, scores).
    fn head(anchors: &[([f32; 4], Vec<f32>)]) -> Array3<f32> {
        let nc = anchors[0].1.len();
        let mut out = Array3::<f32>::zeros((1, 4 + nc, anchors.len()));
        for (i, (bbox, scores)) in anchors.iter().enumerate() {
            for (r, v) in bbox.iter().chain(scores.iter()).enumerate() {
                out[[0, r, i]] = *v;
            }
        }
        out
    }

    fn scores(nc: usize, hot: &[(usize, f32)]) -> Vec<f32> {
        let mut s = vec![0.0; nc];
        for &(c, v) in hot {
            s[c] = v;
        }
        s
    }

    /// 640 input, 640×640 frame, channels first.
    fn decode_square(t: &Array3<f32>, p: &DetectParams) -> Vec<Detection> {
        decode(t.view(), TensorLayout::ChannelsFirst, 640, (640, 640), p).unwrap()
    }

    fn params(conf: f32, iou: f32, allowed: &[usize]) -> DetectParams {
        DetectParams { confidence: conf, iou, allowed_classes: allowed.iter().copied().collect() }
    }

    #[test]
    fn single_anchor_decodes_to_pixel_box() {
        let t = head(&[([320.0, 320.0, 100.0, 50.0], scores(80, &[(0, 0.9)]))]);
        let dets =
            decode(t.view(), TensorLayout::ChannelsFirst, 640, (640, 640), &params(0.5, 0.5, &[]))
                .unwrap();
        assert_eq!(dets.len(), 1);
        let d = &dets[0];
        assert_eq!((d.class_id, d.label), (0, "person"));
        assert!((d.confidence - 0.9).abs() < 1e-6);
        assert!((d.bbox.x - 270.0).abs() < 1e-3);
        assert!((d.bbox.y - 295.0).abs() < 1e-3);
        assert!((d.bbox.width - 100.0).abs() < 1e-3);
        assert!((d.bbox.height - 50.0).abs() < 1e-3);
    }

    #[test]
    fn anchors_first_matches_channels_first() {
        let t = head(&[
            ([100.0, 200.0, 40.0, 60.0], scores(4, &[(2, 0.8)])),
            ([500.0, 100.0, 20.0, 20.0], scores(4, &[(1, 0.6)])),
        ]);
        let p = params(0.5, 0.5, &[]);
        let a = decode(t.view(), TensorLayout::ChannelsFirst, 640, (1280, 720), &p).unwrap();
        let flipped = t.view().permuted_axes([0, 2, 1]).to_owned();
        let b = decode(flipped.view(), TensorLayout::AnchorsFirst, 640, (1280, 720), &p).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 2);
        // per-axis scale: x by 2, y by 1.125
        assert!((a[0].bbox.x - 160.0).abs() < 1e-3);
        assert!((a[0].bbox.height - 67.5).abs() < 1e-3);
    }

    #[test]
    fn threshold_is_strict() {
        let t = head(&[([10.0, 10.0, 4.0, 4.0], scores(3, &[(1, 0.5)]))]);
        let dets = decode_square(&t, &params(0.5, 0.5, &[]));
        assert!(dets.is_empty());
    }

    #[test]
    fn nan_score_is_discarded() {
        let t = head(&[
            ([100.0, 100.0, 20.0, 20.0], vec![f32::NAN, 0.0, 0.0]),
            ([400.0, 400.0, 20.0, 20.0], vec![f32::NAN, 0.8, 0.0]),
        ]);
        let dets = decode_square(&t, &params(0.5, 0.5, &[]));
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].class_id, 1);
        assert!(dets.iter().all(|d| d.confidence > 0.5));
    }

    #[test]
    fn argmax_tie_takes_lower_index() {
        let t = head(&[([10.0, 10.0, 4.0, 4.0], scores(5, &[(3, 0.7), (1, 0.7)]))]);
        let dets = decode_square(&t, &params(0.1, 0.5, &[]));
        assert_eq!(dets[0].class_id, 1);
    }

    #[test]
    fn allowed_classes_filter_before_nms() {
        let t = head(&[
            ([100.0, 100.0, 50.0, 50.0], scores(4, &[(0, 0.95)])),
            ([100.0, 100.0, 50.0, 50.0], scores(4, &[(2, 0.7)])),
            ([400.0, 400.0, 50.0, 50.0], scores(4, &[(3, 0.9)])),
        ]);
        let dets = decode_square(&t, &params(0.5, 0.5, &[2]));
        assert_eq!(dets.len(), 1);
        assert!(dets.iter().all(|d| d.class_id == 2));

        let all = decode_square(&t, &params(0.5, 0.5, &[]));
        // class-agnostic NMS swallows the overlapping class-2 box
        assert_eq!(all.iter().map(|d| d.class_id).collect::<Vec<_>>(), vec![0, 3]);
    }

    #[test]
    fn overlapping_pair_keeps_higher_score() {
        // 100×100 boxes shifted so IoU = 0.8
        let shift = 100.0 - 100.0 * 2.0 * 0.8 / 1.8;
        let t = head(&[
            ([300.0 + shift, 300.0, 100.0, 100.0], scores(2, &[(0, 0.7)])),
            ([300.0, 300.0, 100.0, 100.0], scores(2, &[(0, 0.9)])),
        ]);
        let dets = decode_square(&t, &params(0.5, 0.5, &[]));
        assert_eq!(dets.len(), 1);
        assert!((dets[0].confidence - 0.9).abs() < 1e-6);
        assert!((dets[0].bbox.x - 250.0).abs() < 1e-3);
    }

    #[test]
    fn survivors_never_overlap_past_threshold() {
        let mut anchors = Vec::new();
        for i in 0..30 {
            let f = i as f32;
            let centre = [200.0 + f * 7.0, 200.0 + (f * 3.0) % 40.0, 80.0, 60.0];
            anchors.push((centre, scores(3, &[((i % 3) as usize, 0.5 + f / 100.0)])));
        }
        let t = head(&anchors);
        let p = params(0.55, 0.3, &[]);
        let dets = decode_square(&t, &p);
        assert!(!dets.is_empty());
        for (i, a) in dets.iter().enumerate() {
            assert!(a.confidence > p.confidence);
            for b in &dets[i + 1..] {
                assert!(a.bbox.iou(&b.bbox) <= p.iou);
            }
        }
    }

    #[test]
    fn short_head_is_rejected() {
        let t = Array3::<f32>::zeros((1, 4, 10));
        let p = DetectParams::default();
        let err = decode(t.view(), TensorLayout::ChannelsFirst, 640, (640, 640), &p).unwrap_err();
        assert!(matches!(err, DetectError::InvalidOutputShape(_)));
    }
}
