use crate::model_traits::BayesModuleT;
use crate::variational_linear::VariationalLinear;

use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;

/// A stack of variational linear layers following a dimension chain
/// `dims[0] -> dims[1] -> ... -> dims[last]`, with a ReLU after every
/// layer except the last. The sampling flag is handed to each layer
/// unchanged; the stack keeps no state beyond its layers.
pub struct VariationalStack {
    layers: Vec<VariationalLinear>,
}

impl VariationalStack {
    /// # Arguments
    /// * `dims` - dimension chain (at least input and output)
    /// * `vb` - variable builder; layer j lives under `layer.{j}`
    pub fn new(dims: &[usize], vb: VarBuilder) -> Result<Self> {
        if dims.len() < 2 {
            candle_core::bail!("a stack needs at least two dims, got {:?}", dims);
        }

        let mut layers = Vec::with_capacity(dims.len() - 1);
        for (j, w) in dims.windows(2).enumerate() {
            layers.push(VariationalLinear::new(
                w[0],
                w[1],
                vb.pp(format!("layer.{}", j)),
            )?);
        }
        Ok(Self { layers })
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }
}

impl BayesModuleT for VariationalStack {
    fn forward_t(&self, x_nd: &Tensor, sampling: bool) -> Result<Tensor> {
        let last = self.layers.len() - 1;
        let mut h = x_nd.clone();
        for (j, layer) in self.layers.iter().enumerate() {
            h = layer.forward_t(&h, sampling)?;
            if j < last {
                h = h.relu()?;
            }
        }
        Ok(h)
    }

    fn kl_divergence(&self) -> Result<Tensor> {
        let mut kl = self.layers[0].kl_divergence()?;
        for layer in self.layers.iter().skip(1) {
            kl = (kl + layer.kl_divergence()?)?;
        }
        Ok(kl)
    }

    fn dim_in(&self) -> usize {
        self.layers[0].dim_in()
    }

    fn dim_out(&self) -> usize {
        self.layers[self.layers.len() - 1].dim_out()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::{VarBuilder, VarMap};

    #[test]
    fn dimension_chain() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let stack = VariationalStack::new(&[9, 7, 5, 3], vb)?;

        assert_eq!(stack.num_layers(), 3);
        assert_eq!(stack.dim_in(), 9);
        assert_eq!(stack.dim_out(), 3);

        let x = Tensor::randn(0f32, 1f32, (4, 9), &Device::Cpu)?;
        assert_eq!(stack.forward_t(&x, false)?.dims(), &[4, 3]);
        assert_eq!(stack.forward_t(&x, true)?.dims(), &[4, 3]);
        Ok(())
    }

    #[test]
    fn rejects_degenerate_dims() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        assert!(VariationalStack::new(&[9], vb).is_err());
    }
}
