use crate::model_traits::BayesModuleT;

use candle_core::{DType, Device, Result, Shape, Tensor};
use candle_nn::VarBuilder;

/// Numerically stable softplus: max(x, 0) + log(1 + exp(-|x|))
pub fn softplus(x: &Tensor) -> Result<Tensor> {
    let linear = x.relu()?;
    let curved = (x.abs()?.neg()?.exp()? + 1.0)?.log()?;
    linear + curved
}

/// Random ±1 matrix for the flipout sign perturbations
fn rademacher<S: Into<Shape>>(shape: S, device: &Device) -> Result<Tensor> {
    Tensor::rand(0f32, 1f32, shape, device)?
        .ge(0.5)?
        .to_dtype(DType::F32)?
        .affine(2.0, -1.0)
}

/// KL(N(loc, softplus(raw_scale)) || N(0, 1)) summed over all entries:
/// sum_ij [ (sd^2 + loc^2 - 1) / 2 - ln(sd) ]
fn kl_to_std_normal(loc: &Tensor, raw_scale: &Tensor) -> Result<Tensor> {
    let sd = softplus(raw_scale)?;
    let var = sd.sqr()?;
    ((((var + loc.sqr()?)? - 1.0)? * 0.5)? - sd.log()?)?.sum_all()
}

/// A fully-connected layer whose weights and biases carry independent
/// Gaussian posteriors, parameterized by a location and an unconstrained
/// raw scale. The raw scale may be any real number; it is always mapped
/// through softplus before use, so the standard deviation stays positive
/// without clamping.
pub struct VariationalLinear {
    d_in: usize,
    d_out: usize,
    w_loc: Tensor,
    w_scale: Tensor,
    b_loc: Tensor,
    b_scale: Tensor,
}

impl VariationalLinear {
    /// Create a layer with variables `w_loc`, `w_scale`, `b_loc`,
    /// `b_scale` under the builder's prefix. Locations start from a
    /// variance-scaled (Xavier) draw; raw scales start from the same
    /// draw offset by -6 so the initial posteriors are near-deterministic.
    ///
    /// # Arguments
    /// * `d_in` - input dimension
    /// * `d_out` - output dimension
    /// * `vb` - variable builder (prefix determines the parameter names)
    pub fn new(d_in: usize, d_out: usize, vb: VarBuilder) -> Result<Self> {
        let stdev = (2.0 / (d_in + d_out) as f64).sqrt();
        let init_loc = candle_nn::Init::Randn { mean: 0.0, stdev };
        let init_scale = candle_nn::Init::Randn { mean: -6.0, stdev };

        let w_loc = vb.get_with_hints((d_in, d_out), "w_loc", init_loc)?;
        let w_scale = vb.get_with_hints((d_in, d_out), "w_scale", init_scale)?;
        let b_loc = vb.get_with_hints((1, d_out), "b_loc", init_loc)?;
        let b_scale = vb.get_with_hints((1, d_out), "b_scale", init_scale)?;

        Ok(Self {
            d_in,
            d_out,
            w_loc,
            w_scale,
            b_loc,
            b_scale,
        })
    }

    fn check_input(&self, x_nd: &Tensor) -> Result<(usize, usize)> {
        let (n, d) = x_nd.dims2()?;
        if d != self.d_in {
            candle_core::bail!(
                "input has {} features but the layer expects {}",
                d,
                self.d_in
            );
        }
        Ok((n, d))
    }

    /// Flipout estimator: one shared Gaussian perturbation per tensor,
    /// de-correlated across the batch by per-example sign matrices. The
    /// random draws carry no gradient; gradients reach the location and
    /// scale parameters only.
    fn forward_sampled(&self, x_nd: &Tensor) -> Result<Tensor> {
        let (n, _) = self.check_input(x_nd)?;
        let device = x_nd.device();

        let s_nd = rademacher((n, self.d_in), device)?;
        let r_nk = rademacher((n, self.d_out), device)?;
        let w_eps = Tensor::randn(0f32, 1f32, (self.d_in, self.d_out), device)?;
        let w_samples = softplus(&self.w_scale)?.mul(&w_eps)?;
        let w_perturb = r_nk.mul(&x_nd.mul(&s_nd)?.matmul(&w_samples)?)?;
        let w_out = (x_nd.matmul(&self.w_loc)? + w_perturb)?;

        let r_nk = rademacher((n, self.d_out), device)?;
        let b_eps = Tensor::randn(0f32, 1f32, (1, self.d_out), device)?;
        let b_samples = softplus(&self.b_scale)?.mul(&b_eps)?;
        let b_out = r_nk.broadcast_mul(&b_samples)?.broadcast_add(&self.b_loc)?;

        w_out + b_out
    }

    /// Point-estimate forward pass: x @ w_loc + b_loc
    fn forward_deterministic(&self, x_nd: &Tensor) -> Result<Tensor> {
        self.check_input(x_nd)?;
        x_nd.matmul(&self.w_loc)?.broadcast_add(&self.b_loc)
    }
}

impl BayesModuleT for VariationalLinear {
    fn forward_t(&self, x_nd: &Tensor, sampling: bool) -> Result<Tensor> {
        if sampling {
            self.forward_sampled(x_nd)
        } else {
            self.forward_deterministic(x_nd)
        }
    }

    fn kl_divergence(&self) -> Result<Tensor> {
        kl_to_std_normal(&self.w_loc, &self.w_scale)?
            + kl_to_std_normal(&self.b_loc, &self.b_scale)?
    }

    fn dim_in(&self) -> usize {
        self.d_in
    }

    fn dim_out(&self) -> usize {
        self.d_out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    fn new_layer(d_in: usize, d_out: usize) -> Result<VariationalLinear> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        VariationalLinear::new(d_in, d_out, vb)
    }

    #[test]
    fn deterministic_forward_is_pure() -> Result<()> {
        let layer = new_layer(7, 3)?;
        let x = Tensor::randn(0f32, 1f32, (5, 7), &Device::Cpu)?;

        let out1 = layer.forward_t(&x, false)?.to_vec2::<f32>()?;
        let out2 = layer.forward_t(&x, false)?.to_vec2::<f32>()?;
        assert_eq!(out1, out2);

        Ok(())
    }

    #[test]
    fn kl_divergence_non_negative() -> Result<()> {
        for _ in 0..10 {
            let layer = new_layer(11, 4)?;
            let kl: f32 = layer.kl_divergence()?.to_scalar()?;
            assert!(kl >= -1e-5, "kl = {}", kl);
        }
        Ok(())
    }

    #[test]
    fn flipout_handles_single_example_batch() -> Result<()> {
        let layer = new_layer(6, 2)?;
        let x = Tensor::randn(0f32, 1f32, (1, 6), &Device::Cpu)?;
        let out = layer.forward_t(&x, true)?;
        assert_eq!(out.dims(), &[1, 2]);
        Ok(())
    }

    #[test]
    fn rejects_wrong_input_width() -> Result<()> {
        let layer = new_layer(6, 2)?;
        let x = Tensor::zeros((4, 5), DType::F32, &Device::Cpu)?;
        assert!(layer.forward_t(&x, false).is_err());
        assert!(layer.forward_t(&x, true).is_err());
        Ok(())
    }

    #[test]
    fn rademacher_is_sign_valued() -> Result<()> {
        let m = rademacher((100, 10), &Device::Cpu)?;
        for row in m.to_vec2::<f32>()? {
            for v in row {
                assert!(v == 1.0 || v == -1.0);
            }
        }
        Ok(())
    }

    #[test]
    fn softplus_strictly_positive() -> Result<()> {
        let x = Tensor::randn(0f32, 10f32, (1000,), &Device::Cpu)?;
        let y = softplus(&x)?;
        let min: f32 = y.min(0)?.to_scalar()?;
        assert!(min > 0.0);
        Ok(())
    }
}
