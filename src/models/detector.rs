//! Compact three-scale convolutional detector
//!
//! Variable names follow the `<group>.<layer>.<param>` convention, with the
//! groups `backbone`, `neck`, `yolo_head1` (stride 32), `yolo_head2`
//! (stride 16) and `yolo_head3` (stride 8).

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{conv2d, Conv2d, Conv2dConfig, Dropout, VarBuilder, VarMap};
use tracing::debug;

use crate::config::ModelConfig;
use crate::error::{Error, Result};
use crate::training::network::{DetectionNetwork, NUM_SCALES};

/// Anchors assigned to each output; output 0 is the coarsest grid
pub const ANCHOR_MASKS: [[usize; 3]; NUM_SCALES] = [[6, 7, 8], [3, 4, 5], [0, 1, 2]];

const LEAKY_SLOPE: f64 = 0.1;

/// Convolution followed by leaky ReLU
struct ConvBlock {
    conv: Conv2d,
}

impl ConvBlock {
    fn new(in_c: usize, out_c: usize, kernel: usize, stride: usize, vb: VarBuilder) -> Result<Self> {
        let config = Conv2dConfig {
            padding: kernel / 2,
            stride,
            ..Default::default()
        };
        Ok(Self {
            conv: conv2d(in_c, out_c, kernel, config, vb)?,
        })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let xs = self.conv.forward(xs)?;
        Ok(candle_nn::ops::leaky_relu(&xs, LEAKY_SLOPE)?)
    }
}

struct Backbone {
    stem: ConvBlock,
    stage1: ConvBlock,
    stage2: ConvBlock,
    stage3: ConvBlock,
    stage4: ConvBlock,
}

impl Backbone {
    fn new(c: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            stem: ConvBlock::new(3, c, 3, 2, vb.pp("stem"))?,
            stage1: ConvBlock::new(c, 2 * c, 3, 2, vb.pp("stage1"))?,
            stage2: ConvBlock::new(2 * c, 4 * c, 3, 2, vb.pp("stage2"))?,
            stage3: ConvBlock::new(4 * c, 8 * c, 3, 2, vb.pp("stage3"))?,
            stage4: ConvBlock::new(8 * c, 16 * c, 3, 2, vb.pp("stage4"))?,
        })
    }

    /// Feature maps at strides 8, 16 and 32
    fn forward(&self, xs: &Tensor) -> Result<(Tensor, Tensor, Tensor)> {
        let xs = self.stem.forward(xs)?;
        let xs = self.stage1.forward(&xs)?;
        let c3 = self.stage2.forward(&xs)?;
        let c4 = self.stage3.forward(&c3)?;
        let c5 = self.stage4.forward(&c4)?;
        Ok((c3, c4, c5))
    }
}

struct Neck {
    lateral5: ConvBlock,
    fuse4: ConvBlock,
    lateral4: ConvBlock,
    fuse3: ConvBlock,
    dropout: Dropout,
}

impl Neck {
    fn new(c: usize, dropout: f32, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            lateral5: ConvBlock::new(16 * c, 4 * c, 1, 1, vb.pp("lateral5"))?,
            fuse4: ConvBlock::new(4 * c + 8 * c, 4 * c, 3, 1, vb.pp("fuse4"))?,
            lateral4: ConvBlock::new(4 * c, 2 * c, 1, 1, vb.pp("lateral4"))?,
            fuse3: ConvBlock::new(2 * c + 4 * c, 2 * c, 3, 1, vb.pp("fuse3"))?,
            dropout: Dropout::new(dropout),
        })
    }

    fn forward(&self, c3: &Tensor, c4: &Tensor, c5: &Tensor, train: bool) -> Result<[Tensor; NUM_SCALES]> {
        let p5 = self.lateral5.forward(c5)?;

        let (_, _, h4, w4) = c4.dims4()?;
        let up5 = p5.upsample_nearest2d(h4, w4)?;
        let p4 = self.fuse4.forward(&Tensor::cat(&[&up5, c4], 1)?)?;

        let (_, _, h3, w3) = c3.dims4()?;
        let up4 = self.lateral4.forward(&p4)?.upsample_nearest2d(h3, w3)?;
        let p3 = self.fuse3.forward(&Tensor::cat(&[&up4, c3], 1)?)?;

        Ok([
            self.dropout.forward(&p5, train)?,
            self.dropout.forward(&p4, train)?,
            self.dropout.forward(&p3, train)?,
        ])
    }
}

struct Head {
    conv: ConvBlock,
    pred: Conv2d,
}

impl Head {
    fn new(in_c: usize, out_c: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            conv: ConvBlock::new(in_c, 2 * in_c, 3, 1, vb.pp("conv"))?,
            pred: conv2d(2 * in_c, out_c, 1, Conv2dConfig::default(), vb.pp("pred"))?,
        })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        Ok(self.pred.forward(&self.conv.forward(xs)?)?)
    }
}

/// Three-scale detector whose outputs are `[B, 3 * (5 + C), H / s, W / s]`
/// for `s` = 32, 16, 8
pub struct TinyDetector {
    var_map: VarMap,
    backbone: Backbone,
    neck: Neck,
    heads: [Head; NUM_SCALES],
    training: bool,
}

impl TinyDetector {
    /// Build a freshly initialized detector on `device`
    pub fn new(config: &ModelConfig, device: &Device) -> Result<Self> {
        config.validate()?;

        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, device);
        let c = config.base_channels;
        let out_c = ANCHOR_MASKS[0].len() * (5 + config.num_classes);

        let backbone = Backbone::new(c, vb.pp("backbone"))?;
        let neck = Neck::new(c, config.dropout, vb.pp("neck"))?;
        let heads = [
            Head::new(4 * c, out_c, vb.pp("yolo_head1"))?,
            Head::new(4 * c, out_c, vb.pp("yolo_head2"))?,
            Head::new(2 * c, out_c, vb.pp("yolo_head3"))?,
        ];

        debug!(
            "TinyDetector: {} classes, base width {}, {} variables",
            config.num_classes,
            c,
            var_map.all_vars().len()
        );

        Ok(Self {
            var_map,
            backbone,
            neck,
            heads,
            training: true,
        })
    }
}

impl DetectionNetwork for TinyDetector {
    fn forward(&self, images: &Tensor) -> Result<[Tensor; NUM_SCALES]> {
        let (_, channels, h, w) = images.dims4()?;
        if channels != 3 || h % 32 != 0 || w % 32 != 0 {
            return Err(Error::internal(format!(
                "expected [B, 3, H, W] input with H and W multiples of 32, got {:?}",
                images.dims()
            )));
        }

        let (c3, c4, c5) = self.backbone.forward(images)?;
        let [p5, p4, p3] = self.neck.forward(&c3, &c4, &c5, self.training)?;
        Ok([
            self.heads[0].forward(&p5)?,
            self.heads[1].forward(&p4)?,
            self.heads[2].forward(&p3)?,
        ])
    }

    fn var_map(&self) -> &VarMap {
        &self.var_map
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn is_training(&self) -> bool {
        self.training
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> ModelConfig {
        ModelConfig {
            num_classes: 2,
            input_size: (64, 64),
            base_channels: 2,
            dropout: 0.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_output_shapes() -> Result<()> {
        let device = Device::Cpu;
        let model = TinyDetector::new(&small_config(), &device)?;
        let images = Tensor::zeros((2, 3, 64, 64), DType::F32, &device)?;

        let [o32, o16, o8] = model.forward(&images)?;
        assert_eq!(o32.dims(), &[2, 21, 2, 2]);
        assert_eq!(o16.dims(), &[2, 21, 4, 4]);
        assert_eq!(o8.dims(), &[2, 21, 8, 8]);
        Ok(())
    }

    #[test]
    fn test_parameter_groups() -> Result<()> {
        let model = TinyDetector::new(&small_config(), &Device::Cpu)?;
        let groups: Vec<String> = model.group_names()?.into_iter().collect();
        assert_eq!(
            groups,
            vec!["backbone", "neck", "yolo_head1", "yolo_head2", "yolo_head3"]
        );
        Ok(())
    }

    #[test]
    fn test_rejects_bad_input() -> Result<()> {
        let model = TinyDetector::new(&small_config(), &Device::Cpu)?;
        let images = Tensor::zeros((1, 3, 50, 64), DType::F32, &Device::Cpu)?;
        assert!(model.forward(&images).is_err());
        Ok(())
    }
}
