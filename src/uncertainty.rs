use crate::density_network::DensityNetwork;
use crate::model_traits::BayesModuleT;

use candle_core::Tensor;
use serde::Serialize;

/// Monte-Carlo summary of the posterior predictive, one entry per input
/// example. `prediction`/`prediction_sd` summarize the mean-head samples
/// (ddof = 1); `dispersion`/`dispersion_sd` summarize the dispersion-head
/// samples. `aleatoric` is the average predicted variance (irreducible
/// data noise); `epistemic` is the variance of the mean-head samples
/// across draws (parameter uncertainty).
#[derive(Debug, Serialize)]
pub struct PredictiveSummary {
    pub prediction: Vec<f32>,
    pub prediction_sd: Vec<f32>,
    pub dispersion: Vec<f32>,
    pub dispersion_sd: Vec<f32>,
    pub aleatoric: Vec<f32>,
    pub epistemic: Vec<f32>,
}

/// Run the stochastic forward pass `num_samples` times with independent
/// draws and aggregate. At least two samples are required for the
/// ddof = 1 standard deviations.
pub fn sample_predictive(
    model: &DensityNetwork,
    x_nd: &Tensor,
    num_samples: usize,
) -> anyhow::Result<PredictiveSummary> {
    if num_samples < 2 {
        anyhow::bail!(
            "at least two Monte-Carlo samples are required, got {}",
            num_samples
        );
    }

    let mut mean_cols = Vec::with_capacity(num_samples);
    let mut disp_cols = Vec::with_capacity(num_samples);

    for _ in 0..num_samples {
        let preds = model.forward_t(x_nd, true)?;
        mean_cols.push(preds.narrow(1, 0, 1)?);
        disp_cols.push(preds.narrow(1, 1, 1)?);
    }

    let p_nt = Tensor::cat(&mean_cols, 1)?;
    let d_nt = Tensor::cat(&disp_cols, 1)?;

    let t = num_samples as f64;
    let ddof_adjust = t / (t - 1.0);

    let p_mean = p_nt.mean(1)?;
    let p_var = (p_nt.sqr()?.mean(1)? - p_mean.sqr()?)?;
    let p_sd = (p_var.relu()? * ddof_adjust)?.sqrt()?;

    let d_mean = d_nt.mean(1)?;
    let d_var = (d_nt.sqr()?.mean(1)? - d_mean.sqr()?)?;
    let d_sd = (d_var.relu()? * ddof_adjust)?.sqrt()?;

    let aleatoric = d_nt.sqr()?.mean(1)?;

    Ok(PredictiveSummary {
        prediction: p_mean.to_vec1()?,
        prediction_sd: p_sd.to_vec1()?,
        dispersion: d_mean.to_vec1()?,
        dispersion_sd: d_sd.to_vec1()?,
        aleatoric: aleatoric.to_vec1()?,
        epistemic: p_var.to_vec1()?,
    })
}
