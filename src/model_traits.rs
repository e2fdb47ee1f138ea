use candle_core::{Result, Tensor};

/// Common capability of every variational module in the model: a forward
/// pass that either samples the weight posteriors or uses their location
/// (point) estimates, plus the KL divergence of all posteriors against
/// the standard normal prior.
pub trait BayesModuleT {
    /// # Arguments
    /// * `x_nd` - input batch (n x d_in)
    /// * `sampling` - draw posterior samples (flipout path) if true;
    ///   use the location parameters only if false
    ///
    /// # Returns
    /// Output batch (n x d_out)
    fn forward_t(&self, x_nd: &Tensor, sampling: bool) -> Result<Tensor>;

    /// Sum of KL(q(θ) || N(0,1)) over every weight and bias entry
    fn kl_divergence(&self) -> Result<Tensor>;

    fn dim_in(&self) -> usize;

    fn dim_out(&self) -> usize;
}
