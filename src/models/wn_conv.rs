//! Weight-normalized 1D convolutions
//!
//! Reparameterized convolution layers holding a per-channel magnitude
//! (`weight_g`) and a direction tensor (`weight_v`). The effective kernel
//! `g * v / ||v||` is recomputed on every call from the held parameters, so
//! the output is bit-for-bit reproducible for a given parameter pair, and
//! the per-channel kernel norm always equals the magnitude.

use anyhow::{bail, Result};
use candle_core::{Module, Tensor};
use candle_nn::{Conv1dConfig, ConvTranspose1dConfig, VarBuilder};

/// Weight-normalized Conv1d.
///
/// `weight_g` has shape `(out_channels, 1, 1)`; `weight_v` has the kernel's
/// native shape `(out_channels, in_channels / groups, kernel_size)`. The
/// direction norm is taken over all axes except the output-channel axis.
pub struct WeightNormConv1d {
    weight_g: Tensor,
    weight_v: Tensor,
    bias: Option<Tensor>,
    config: Conv1dConfig,
}

impl WeightNormConv1d {
    /// Load `weight_g` / `weight_v` (and optionally `bias`) from a
    /// [`VarBuilder`].
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        config: Conv1dConfig,
        use_bias: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let weight_g = vb.get((out_channels, 1, 1), "weight_g")?;
        let weight_v = vb.get(
            (out_channels, in_channels / config.groups, kernel_size),
            "weight_v",
        )?;
        let bias = if use_bias {
            Some(vb.get(out_channels, "bias")?)
        } else {
            None
        };
        Self::from_weights(weight_g, weight_v, bias, config)
    }

    /// Create from raw parameter tensors.
    pub fn from_weights(
        weight_g: Tensor,
        weight_v: Tensor,
        bias: Option<Tensor>,
        config: Conv1dConfig,
    ) -> Result<Self> {
        let (out_channels, _, _) = weight_v.dims3()?;
        if weight_g.dims() != [out_channels, 1, 1] {
            bail!(
                "weight_g shape {:?} does not match out_channels {}",
                weight_g.dims(),
                out_channels
            );
        }
        if let Some(b) = &bias {
            if b.dims() != [out_channels] {
                bail!(
                    "bias shape {:?} does not match out_channels {}",
                    b.dims(),
                    out_channels
                );
            }
        }
        Ok(Self {
            weight_g,
            weight_v,
            bias,
            config,
        })
    }

    /// Effective kernel `g * v / ||v||`, norm over all axes but dim 0.
    pub fn effective_weight(&self) -> Result<Tensor> {
        let norm = self.weight_v.sqr()?.sum_keepdim((1, 2))?.sqrt()?;
        Ok(self
            .weight_v
            .broadcast_mul(&self.weight_g)?
            .broadcast_div(&norm)?)
    }

    /// Input shape `[batch, in_channels, seq]`, output
    /// `[batch, out_channels, seq']`.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let weight = self.effective_weight()?;
        let out = x.conv1d(
            &weight,
            self.config.padding,
            self.config.stride,
            self.config.dilation,
            self.config.groups,
        )?;
        match &self.bias {
            Some(b) => {
                let b = b.reshape((1, b.dim(0)?, 1))?;
                Ok(out.broadcast_add(&b)?)
            }
            None => Ok(out),
        }
    }
}

impl Module for WeightNormConv1d {
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        WeightNormConv1d::forward(self, x).map_err(|e| candle_core::Error::Msg(e.to_string()))
    }
}

/// Weight-normalized ConvTranspose1d.
///
/// Kernel layout is `(in_channels, out_channels / groups, kernel_size)`, so
/// the magnitude is per input channel: `weight_g` has shape
/// `(in_channels, 1, 1)` and the direction norm is taken over all axes
/// except the input-channel axis.
pub struct WeightNormConvTranspose1d {
    weight_g: Tensor,
    weight_v: Tensor,
    bias: Option<Tensor>,
    config: ConvTranspose1dConfig,
}

impl WeightNormConvTranspose1d {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        config: ConvTranspose1dConfig,
        use_bias: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let weight_g = vb.get((in_channels, 1, 1), "weight_g")?;
        let weight_v = vb.get(
            (in_channels, out_channels / config.groups, kernel_size),
            "weight_v",
        )?;
        let bias = if use_bias {
            Some(vb.get(out_channels, "bias")?)
        } else {
            None
        };
        Self::from_weights(weight_g, weight_v, bias, config)
    }

    /// Create from raw parameter tensors.
    pub fn from_weights(
        weight_g: Tensor,
        weight_v: Tensor,
        bias: Option<Tensor>,
        config: ConvTranspose1dConfig,
    ) -> Result<Self> {
        let (in_channels, out_per_group, _) = weight_v.dims3()?;
        if weight_g.dims() != [in_channels, 1, 1] {
            bail!(
                "weight_g shape {:?} does not match in_channels {}",
                weight_g.dims(),
                in_channels
            );
        }
        if let Some(b) = &bias {
            let out_channels = out_per_group * config.groups;
            if b.dims() != [out_channels] {
                bail!(
                    "bias shape {:?} does not match out_channels {}",
                    b.dims(),
                    out_channels
                );
            }
        }
        Ok(Self {
            weight_g,
            weight_v,
            bias,
            config,
        })
    }

    /// Effective kernel `g * v / ||v||`, norm over all axes but dim 0.
    pub fn effective_weight(&self) -> Result<Tensor> {
        let norm = self.weight_v.sqr()?.sum_keepdim((1, 2))?.sqrt()?;
        Ok(self
            .weight_v
            .broadcast_mul(&self.weight_g)?
            .broadcast_div(&norm)?)
    }

    /// Input shape `[batch, in_channels, seq]`, output
    /// `[batch, out_channels, seq']`.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let weight = self.effective_weight()?;
        let out = x.conv_transpose1d(
            &weight,
            self.config.padding,
            self.config.output_padding,
            self.config.stride,
            self.config.dilation,
            self.config.groups,
        )?;
        match &self.bias {
            Some(b) => {
                let b = b.reshape((1, b.dim(0)?, 1))?;
                Ok(out.broadcast_add(&b)?)
            }
            None => Ok(out),
        }
    }
}

impl Module for WeightNormConvTranspose1d {
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        WeightNormConvTranspose1d::forward(self, x)
            .map_err(|e| candle_core::Error::Msg(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, IndexOp};

    fn channel_norms(weight: &Tensor) -> Vec<f32> {
        weight
            .sqr()
            .unwrap()
            .sum_keepdim((1, 2))
            .unwrap()
            .sqrt()
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap()
    }

    #[test]
    fn test_effective_kernel_norm_equals_magnitude() {
        let device = Device::Cpu;
        let weight_g =
            Tensor::from_vec(vec![0.5f32, 1.5, 2.5], (3, 1, 1), &device).unwrap();
        let weight_v = Tensor::randn(0.0f32, 1.0, (3, 4, 5), &device).unwrap();
        let conv = WeightNormConv1d::from_weights(
            weight_g,
            weight_v,
            None,
            Conv1dConfig::default(),
        )
        .unwrap();

        let norms = channel_norms(&conv.effective_weight().unwrap());
        let expected = [0.5f32, 1.5, 2.5];
        for (norm, expected) in norms.iter().zip(expected) {
            assert!((norm - expected).abs() < 1e-5, "{norm} vs {expected}");
        }
    }

    #[test]
    fn test_forward_is_reproducible() {
        let device = Device::Cpu;
        let weight_g = Tensor::from_vec(vec![1.0f32, 2.0], (2, 1, 1), &device).unwrap();
        let weight_v = Tensor::randn(0.0f32, 1.0, (2, 3, 3), &device).unwrap();
        let conv = WeightNormConv1d::from_weights(
            weight_g,
            weight_v,
            None,
            Conv1dConfig::default(),
        )
        .unwrap();

        let x = Tensor::randn(0.0f32, 1.0, (1, 3, 16), &device).unwrap();
        let a: Vec<f32> = conv
            .forward(&x)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        let b: Vec<f32> = conv
            .forward(&x)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_conv_shape_and_bias() {
        let device = Device::Cpu;
        let weight_g = Tensor::ones((2, 1, 1), DType::F32, &device).unwrap();
        let weight_v = Tensor::randn(0.0f32, 1.0, (2, 3, 3), &device).unwrap();
        let bias = Tensor::from_vec(vec![10.0f32, -10.0], (2,), &device).unwrap();
        let config = Conv1dConfig {
            padding: 1,
            ..Default::default()
        };

        let no_bias = WeightNormConv1d::from_weights(
            weight_g.clone(),
            weight_v.clone(),
            None,
            config,
        )
        .unwrap();
        let with_bias =
            WeightNormConv1d::from_weights(weight_g, weight_v, Some(bias), config).unwrap();

        let x = Tensor::randn(0.0f32, 1.0, (1, 3, 8), &device).unwrap();
        let base = no_bias.forward(&x).unwrap();
        let shifted = with_bias.forward(&x).unwrap();
        assert_eq!(base.dims(), &[1, 2, 8]);

        let base_v: Vec<f32> = base.i((0, 0, ..)).unwrap().to_vec1().unwrap();
        let shifted_v: Vec<f32> = shifted.i((0, 0, ..)).unwrap().to_vec1().unwrap();
        for (b, s) in base_v.iter().zip(&shifted_v) {
            assert!((s - b - 10.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_mismatched_magnitude_shape_is_rejected() {
        let device = Device::Cpu;
        let weight_g = Tensor::ones((4, 1, 1), DType::F32, &device).unwrap();
        let weight_v = Tensor::randn(0.0f32, 1.0, (2, 3, 3), &device).unwrap();
        let result =
            WeightNormConv1d::from_weights(weight_g, weight_v, None, Conv1dConfig::default());
        assert!(result.is_err());
    }

    #[test]
    fn test_transposed_norm_is_per_input_channel() {
        let device = Device::Cpu;
        let weight_g =
            Tensor::from_vec(vec![0.25f32, 4.0], (2, 1, 1), &device).unwrap();
        let weight_v = Tensor::randn(0.0f32, 1.0, (2, 3, 4), &device).unwrap();
        let conv = WeightNormConvTranspose1d::from_weights(
            weight_g,
            weight_v,
            None,
            ConvTranspose1dConfig::default(),
        )
        .unwrap();

        let norms = channel_norms(&conv.effective_weight().unwrap());
        assert!((norms[0] - 0.25).abs() < 1e-5);
        assert!((norms[1] - 4.0).abs() < 1e-5);
    }

    #[test]
    fn test_transposed_upsamples() {
        let device = Device::Cpu;
        let weight_g = Tensor::ones((4, 1, 1), DType::F32, &device).unwrap();
        let weight_v = Tensor::randn(0.0f32, 0.1, (4, 2, 4), &device).unwrap();
        let config = ConvTranspose1dConfig {
            stride: 2,
            ..Default::default()
        };
        let conv =
            WeightNormConvTranspose1d::from_weights(weight_g, weight_v, None, config).unwrap();

        let x = Tensor::randn(0.0f32, 1.0, (1, 4, 10), &device).unwrap();
        let out = conv.forward(&x).unwrap();
        // (10 - 1) * 2 + 4 = 22
        assert_eq!(out.dims(), &[1, 2, 22]);
    }
}
