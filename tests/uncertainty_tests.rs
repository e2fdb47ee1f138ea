use milpa::candle_core::{DType, Device, Tensor};
use milpa::candle_nn::{VarBuilder, VarMap};
use milpa::density_network::DensityNetwork;
use milpa::uncertainty::sample_predictive;

fn new_network(trunk_dims: &[usize], head_dims: &[usize]) -> (DensityNetwork, VarMap) {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let model = DensityNetwork::new(trunk_dims, head_dims, vb).expect("network");
    (model, varmap)
}

/// Widen the posterior scales so the stochastic forward pass has a
/// visible epistemic spread (fresh networks start near-deterministic).
fn widen_posteriors(varmap: &VarMap) {
    let data = varmap.data().lock().expect("varmap lock");
    for (name, var) in data.iter() {
        if name.ends_with("_scale") {
            let wide = Tensor::full(0.5f32, var.dims(), &Device::Cpu).expect("scale tensor");
            var.set(&wide).expect("set scale");
        }
    }
}

#[test]
fn too_few_samples_rejected() {
    let (model, _varmap) = new_network(&[4, 4], &[4, 1]);
    let x = Tensor::zeros((1, 4), DType::F32, &Device::Cpu).expect("x");

    assert!(sample_predictive(&model, &x, 0).is_err());
    assert!(sample_predictive(&model, &x, 1).is_err());
    assert!(sample_predictive(&model, &x, 2).is_ok());
}

#[test]
fn summary_statistics_are_consistent() -> anyhow::Result<()> {
    let (model, varmap) = new_network(&[4, 4], &[4, 1]);
    widen_posteriors(&varmap);

    let x = Tensor::randn(0f32, 1f32, (5, 4), &Device::Cpu)?;
    let summary = sample_predictive(&model, &x, 50)?;

    assert_eq!(summary.prediction.len(), 5);
    assert_eq!(summary.prediction_sd.len(), 5);
    assert_eq!(summary.dispersion.len(), 5);
    assert_eq!(summary.dispersion_sd.len(), 5);
    assert_eq!(summary.aleatoric.len(), 5);
    assert_eq!(summary.epistemic.len(), 5);

    for i in 0..5 {
        assert!(summary.prediction[i].is_finite());
        assert!(summary.prediction_sd[i] >= 0.0);
        assert!(summary.dispersion[i] > 0.0);
        assert!(summary.aleatoric[i] > 0.0);
        assert!(summary.epistemic[i] >= 0.0);
        // the sampled posterior is wide, so parameter uncertainty shows up
        assert!(summary.prediction_sd[i] > 0.0);
    }
    Ok(())
}

#[test]
fn more_samples_tighten_the_epistemic_estimate() -> anyhow::Result<()> {
    let (model, varmap) = new_network(&[4, 4], &[4, 1]);
    widen_posteriors(&varmap);

    let x = Tensor::randn(0f32, 1f32, (1, 4), &Device::Cpu)?;

    let estimator_variance = |t: usize, trials: usize| -> anyhow::Result<f64> {
        let estimates: Vec<f64> = (0..trials)
            .map(|_| sample_predictive(&model, &x, t).map(|s| s.epistemic[0] as f64))
            .collect::<anyhow::Result<_>>()?;
        let mean = estimates.iter().sum::<f64>() / trials as f64;
        Ok(estimates.iter().map(|e| (e - mean).powi(2)).sum::<f64>() / trials as f64)
    };

    let var_coarse = estimator_variance(10, 20)?;
    let var_fine = estimator_variance(250, 20)?;

    assert!(
        var_fine < var_coarse,
        "T=250 variance {} should be below T=10 variance {}",
        var_fine,
        var_coarse
    );
    Ok(())
}
