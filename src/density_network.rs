use crate::model_traits::BayesModuleT;
use crate::variational_linear::softplus;
use crate::variational_stack::VariationalStack;

use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;

const LN_2PI: f64 = 1.8378770664093453;

/// Variational network with one trunk and two heads. The mean head
/// predicts the conditional mean of the target; the dispersion head
/// predicts a per-example standard deviation, forced positive through
/// softplus, so every prediction carries its own learned noise scale.
///
/// Variables live under the prefixes `trunk`, `mean` and `disp`, which
/// is also how the persisted parameter set is keyed.
pub struct DensityNetwork {
    trunk: VariationalStack,
    mean_head: VariationalStack,
    disp_head: VariationalStack,
}

impl DensityNetwork {
    /// # Arguments
    /// * `trunk_dims` - trunk dimension chain, e.g. [293, 256, 128]
    /// * `head_dims` - head chain after the trunk output, e.g. [64, 32, 1];
    ///   both heads consume the trunk's last output dimension
    /// * `vb` - variable builder
    pub fn new(trunk_dims: &[usize], head_dims: &[usize], vb: VarBuilder) -> Result<Self> {
        if trunk_dims.len() < 2 {
            candle_core::bail!("trunk needs at least two dims, got {:?}", trunk_dims);
        }
        if head_dims.last() != Some(&1) {
            candle_core::bail!("each head must end in a single output, got {:?}", head_dims);
        }

        let mut full_head_dims = Vec::with_capacity(head_dims.len() + 1);
        full_head_dims.push(trunk_dims[trunk_dims.len() - 1]);
        full_head_dims.extend_from_slice(head_dims);

        Ok(Self {
            trunk: VariationalStack::new(trunk_dims, vb.pp("trunk"))?,
            mean_head: VariationalStack::new(&full_head_dims, vb.pp("mean"))?,
            disp_head: VariationalStack::new(&full_head_dims, vb.pp("disp"))?,
        })
    }

    /// Gaussian log density of `y_n1` under N(mean, dispersion), one
    /// value per example. The caller decides how to reduce.
    pub fn log_likelihood(&self, x_nd: &Tensor, y_n1: &Tensor, sampling: bool) -> Result<Tensor> {
        let (n, k) = y_n1.dims2()?;
        if k != 1 {
            candle_core::bail!("target must be (n x 1), got ({} x {})", n, k);
        }

        let preds = self.forward_t(x_nd, sampling)?;
        let mean_n1 = preds.narrow(1, 0, 1)?;
        let sd_n1 = preds.narrow(1, 1, 1)?;

        let z_n1 = y_n1.sub(&mean_n1)?.div(&sd_n1)?;
        let llik_n1 = ((z_n1.sqr()? * (-0.5))? - sd_n1.log()?)? - 0.5 * LN_2PI;
        llik_n1?.squeeze(1)
    }

    /// Deterministic per-example (mean, dispersion) pairs as plain values
    pub fn point_predictions(&self, x_nd: &Tensor) -> Result<Vec<(f32, f32)>> {
        let preds = self.forward_t(x_nd, false)?.to_vec2::<f32>()?;
        Ok(preds.into_iter().map(|row| (row[0], row[1])).collect())
    }
}

impl BayesModuleT for DensityNetwork {
    /// Returns (n x 2): column 0 is the predicted mean, column 1 the
    /// strictly positive predicted dispersion.
    fn forward_t(&self, x_nd: &Tensor, sampling: bool) -> Result<Tensor> {
        let h = self.trunk.forward_t(x_nd, sampling)?.relu()?;
        let mean_n1 = self.mean_head.forward_t(&h, sampling)?;
        let disp_n1 = softplus(&self.disp_head.forward_t(&h, sampling)?)?;
        Tensor::cat(&[mean_n1, disp_n1], 1)
    }

    fn kl_divergence(&self) -> Result<Tensor> {
        (self.trunk.kl_divergence()? + self.mean_head.kl_divergence()?)?
            + self.disp_head.kl_divergence()?
    }

    fn dim_in(&self) -> usize {
        self.trunk.dim_in()
    }

    fn dim_out(&self) -> usize {
        2
    }
}
