//! YOLO per-scale loss
//!
//! Each ground-truth box is matched to the single best of the nine anchors
//! by width/height IoU. A scale only learns from boxes whose best anchor is
//! one of its three; that anchor's cell becomes a positive sample.
//!
//! Terms, all summed:
//! - center offsets: BCE with logits, weighted by `2 - w * h`
//! - log size: half squared error, weighted the same way
//! - objectness: BCE with logits over positives and negatives
//! - classes: BCE with logits on positives

use candle_core::{DType, Device, Tensor, D};

use crate::config::ModelConfig;
use crate::error::{Error, Result};
use crate::models::detector::ANCHOR_MASKS;
use crate::training::loss::ScaleLoss;

/// Anchor-matched YOLO loss for one output scale
#[derive(Debug, Clone)]
pub struct YoloScaleLoss {
    anchors: Vec<[f32; 2]>,
    num_classes: usize,
    input_size: (usize, usize),
}

/// Dense training targets of one scale
struct ScaleTargets {
    obj: Vec<f32>,
    noobj: Vec<f32>,
    tx: Vec<f32>,
    ty: Vec<f32>,
    tw: Vec<f32>,
    th: Vec<f32>,
    box_scale: Vec<f32>,
    cls: Vec<f32>,
    positives: usize,
}

impl YoloScaleLoss {
    /// Build from the detector configuration
    pub fn new(config: &ModelConfig) -> Self {
        Self {
            anchors: config.anchors.clone(),
            num_classes: config.num_classes,
            input_size: config.input_size,
        }
    }

    /// Index of the anchor whose shape best overlaps a `w x h` box (pixels)
    fn best_anchor(&self, w: f32, h: f32) -> usize {
        let mut best = 0;
        let mut best_iou = f32::MIN;
        for (i, [aw, ah]) in self.anchors.iter().enumerate() {
            let inter = w.min(*aw) * h.min(*ah);
            let iou = inter / (w * h + aw * ah - inter);
            if iou > best_iou {
                best_iou = iou;
                best = i;
            }
        }
        best
    }

    fn build_targets(&self, scale: usize, targets: &[Tensor], grid: (usize, usize)) -> Result<ScaleTargets> {
        let (gh, gw) = grid;
        let (input_h, input_w) = self.input_size;
        let mask = ANCHOR_MASKS[scale];
        let na = mask.len();
        let cells = targets.len() * na * gh * gw;

        let mut t = ScaleTargets {
            obj: vec![0.0; cells],
            noobj: vec![1.0; cells],
            tx: vec![0.0; cells],
            ty: vec![0.0; cells],
            tw: vec![0.0; cells],
            th: vec![0.0; cells],
            box_scale: vec![0.0; cells],
            cls: vec![0.0; cells * self.num_classes],
            positives: 0,
        };

        for (b, boxes) in targets.iter().enumerate() {
            if boxes.elem_count() == 0 {
                continue;
            }
            let rows = boxes.to_dtype(DType::F32)?.to_vec2::<f32>()?;
            for row in rows {
                let [cx, cy, w, h, class] = match row.as_slice() {
                    &[cx, cy, w, h, class] => [cx, cy, w, h, class],
                    _ => {
                        return Err(Error::internal(format!(
                            "target rows must have 5 columns, got {}",
                            row.len()
                        )))
                    }
                };
                if w <= 0.0 || h <= 0.0 {
                    continue;
                }

                let best = self.best_anchor(w * input_w as f32, h * input_h as f32);
                let Some(a) = mask.iter().position(|&m| m == best) else {
                    continue;
                };

                let gx = cx * gw as f32;
                let gy = cy * gh as f32;
                let gi = (gx.floor().max(0.0) as usize).min(gw - 1);
                let gj = (gy.floor().max(0.0) as usize).min(gh - 1);
                let idx = ((b * na + a) * gh + gj) * gw + gi;

                if t.obj[idx] == 0.0 {
                    t.positives += 1;
                }
                t.obj[idx] = 1.0;
                t.noobj[idx] = 0.0;
                t.tx[idx] = gx - gi as f32;
                t.ty[idx] = gy - gj as f32;

                let [aw, ah] = self.anchors[best];
                t.tw[idx] = (w * input_w as f32 / aw).ln();
                t.th[idx] = (h * input_h as f32 / ah).ln();
                t.box_scale[idx] = 2.0 - w * h;

                let class = class.max(0.0) as usize;
                if class < self.num_classes {
                    t.cls[idx * self.num_classes + class] = 1.0;
                }
            }
        }

        Ok(t)
    }
}

/// Numerically stable `BCE(sigmoid(logits), targets)`, elementwise
fn bce_with_logits(logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
    let softplus = (logits.abs()?.neg()?.exp()? + 1.0)?.log()?;
    Ok(((logits.relu()? - (logits * targets)?)? + softplus)?)
}

fn dense(values: Vec<f32>, shape: &[usize], device: &Device) -> Result<Tensor> {
    Ok(Tensor::from_vec(values, shape, device)?)
}

impl ScaleLoss for YoloScaleLoss {
    fn compute(&self, scale: usize, output: &Tensor, targets: &[Tensor]) -> Result<(Tensor, usize)> {
        if scale >= ANCHOR_MASKS.len() {
            return Err(Error::internal(format!("no anchors for scale {}", scale)));
        }
        let (b, channels, gh, gw) = output.dims4()?;
        let na = ANCHOR_MASKS[scale].len();
        let attrs = 5 + self.num_classes;
        if channels != na * attrs {
            return Err(Error::internal(format!(
                "scale {} output has {} channels, expected {}",
                scale,
                channels,
                na * attrs
            )));
        }
        if targets.len() != b {
            return Err(Error::internal(format!(
                "{} target sets for a batch of {}",
                targets.len(),
                b
            )));
        }

        // [B, A, H, W, 5 + C]
        let pred = output
            .reshape((b, na, attrs, gh, gw))?
            .permute((0, 1, 3, 4, 2))?
            .contiguous()?;
        let field = |i: usize| -> Result<Tensor> { Ok(pred.narrow(D::Minus1, i, 1)?.squeeze(D::Minus1)?) };
        let (x, y, w, h, conf) = (field(0)?, field(1)?, field(2)?, field(3)?, field(4)?);
        let cls = pred.narrow(D::Minus1, 5, self.num_classes)?;

        let t = self.build_targets(scale, targets, (gh, gw))?;
        let device = output.device();
        let shape = [b, na, gh, gw];
        let obj = dense(t.obj, &shape, device)?;
        let noobj = dense(t.noobj, &shape, device)?;
        let tx = dense(t.tx, &shape, device)?;
        let ty = dense(t.ty, &shape, device)?;
        let tw = dense(t.tw, &shape, device)?;
        let th = dense(t.th, &shape, device)?;
        let box_scale = dense(t.box_scale, &shape, device)?;
        let tcls = dense(t.cls, &[b, na, gh, gw, self.num_classes], device)?;

        let weight = (&obj * &box_scale)?;
        let loss_x = (bce_with_logits(&x, &tx)? * &weight)?.sum_all()?;
        let loss_y = (bce_with_logits(&y, &ty)? * &weight)?.sum_all()?;
        let loss_w = ((w - tw)?.sqr()? * &weight)?.sum_all()?.affine(0.5, 0.0)?;
        let loss_h = ((h - th)?.sqr()? * &weight)?.sum_all()?.affine(0.5, 0.0)?;

        let conf_bce = bce_with_logits(&conf, &obj)?;
        let loss_conf = ((&conf_bce * &obj)?.sum_all()? + (&conf_bce * &noobj)?.sum_all()?)?;

        let loss_cls = bce_with_logits(&cls, &tcls)?
            .broadcast_mul(&obj.unsqueeze(D::Minus1)?)?
            .sum_all()?;

        let loss = (((((loss_x + loss_y)? + loss_w)? + loss_h)? + loss_conf)? + loss_cls)?;
        Ok((loss, t.positives))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ModelConfig {
        ModelConfig {
            num_classes: 2,
            input_size: (64, 64),
            ..Default::default()
        }
    }

    #[test]
    fn test_best_anchor() {
        let loss = YoloScaleLoss::new(&config());
        assert_eq!(loss.best_anchor(12.0, 16.0), 0);
        assert_eq!(loss.best_anchor(450.0, 400.0), 8);
        assert_eq!(loss.best_anchor(140.0, 112.0), 6);
    }

    #[test]
    fn test_positive_goes_to_matching_scale() -> Result<()> {
        let loss = YoloScaleLoss::new(&config());
        let device = Device::Cpu;
        // 12.8 x 16 px in a 64 px input: best anchor 0, owned by the stride 8 output
        let boxes = Tensor::new(&[[0.5f32, 0.5, 0.2, 0.25, 1.0]], &device)?;
        let targets = vec![boxes];

        let coarse = Tensor::zeros((1, 21, 2, 2), DType::F32, &device)?;
        let fine = Tensor::zeros((1, 21, 8, 8), DType::F32, &device)?;

        let (_, n_coarse) = loss.compute(0, &coarse, &targets)?;
        let (value, n_fine) = loss.compute(2, &fine, &targets)?;
        assert_eq!(n_coarse, 0);
        assert_eq!(n_fine, 1);

        let value = value.to_scalar::<f32>()?;
        assert!(value.is_finite() && value > 0.0);
        Ok(())
    }

    #[test]
    fn test_empty_targets_only_penalize_objectness() -> Result<()> {
        let loss = YoloScaleLoss::new(&config());
        let device = Device::Cpu;
        let targets = vec![Tensor::zeros((0, 5), DType::F32, &device)?];
        let output = Tensor::zeros((1, 21, 2, 2), DType::F32, &device)?;

        let (value, positives) = loss.compute(0, &output, &targets)?;
        assert_eq!(positives, 0);
        // 12 negatives with logit 0: 12 * ln 2
        let expected = 12.0 * std::f32::consts::LN_2;
        assert!((value.to_scalar::<f32>()? - expected).abs() < 1e-4);
        Ok(())
    }
}
