use crate::data_loader::DataLoader;
use crate::density_network::DensityNetwork;
use crate::model_traits::BayesModuleT;

use candle_core::{Device, Tensor, Var};
use candle_nn::{AdamW, Optimizer, VarMap};
use indicatif::{ProgressBar, ProgressDrawTarget};
use log::{info, warn};

pub struct TrainConfig {
    pub learning_rate: f64,
    pub batch_size: usize,
    pub num_epochs: usize,
    /// gradient values are clamped to [-grad_clip, grad_clip]
    pub grad_clip: f64,
    /// multiplicative learning-rate decay applied every `lr_decay_steps`
    pub lr_decay_rate: f64,
    pub lr_decay_steps: usize,
    pub device: Device,
    pub verbose: bool,
    pub show_progress: bool,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            batch_size: 32,
            num_epochs: 100,
            grad_clip: 0.5,
            lr_decay_rate: 0.8,
            lr_decay_steps: 2000,
            device: Device::Cpu,
            verbose: false,
            show_progress: true,
        }
    }
}

/// Per-epoch training history; dropped once the caller is done with it,
/// only the network parameters persist.
pub struct TrainTrace {
    pub elbo_loss: Vec<f32>,
    pub validation_mae: Vec<f32>,
}

/// Minimizes the negative ELBO over minibatches:
/// `loss = kl / N_total - mean(log_likelihood)`, with the global KL
/// rescaled by the training-set size so both terms stay on a
/// per-example scale regardless of batch size.
pub struct Trainer<'a> {
    pub model: &'a DensityNetwork,
    pub variable_map: &'a VarMap,
}

impl<'a> Trainer<'a> {
    pub fn new(model: &'a DensityNetwork, variable_map: &'a VarMap) -> Self {
        Self {
            model,
            variable_map,
        }
    }

    /// Train all posterior parameters.
    ///
    /// * `data` - minibatch loader over the training split
    /// * `validation` - optional held-out `(x, y)` pair; evaluated
    ///   deterministically after each epoch, never updates parameters
    pub fn train<D>(
        &mut self,
        data: &mut D,
        validation: Option<(&Tensor, &Tensor)>,
        config: &TrainConfig,
    ) -> anyhow::Result<TrainTrace>
    where
        D: DataLoader,
    {
        self.run(self.variable_map.all_vars(), data, validation, config)
    }

    /// Transfer-learning pass: only the mean/dispersion head parameters
    /// receive updates; the trunk stays frozen bit-for-bit.
    pub fn train_heads_only<D>(
        &mut self,
        data: &mut D,
        validation: Option<(&Tensor, &Tensor)>,
        config: &TrainConfig,
    ) -> anyhow::Result<TrainTrace>
    where
        D: DataLoader,
    {
        let head_vars = vars_with_prefix(self.variable_map, &["mean.", "disp."]);
        if head_vars.is_empty() {
            anyhow::bail!("no head variables found in the variable map");
        }
        self.run(head_vars, data, validation, config)
    }

    fn run<D>(
        &mut self,
        trainable: Vec<Var>,
        data: &mut D,
        validation: Option<(&Tensor, &Tensor)>,
        config: &TrainConfig,
    ) -> anyhow::Result<TrainTrace>
    where
        D: DataLoader,
    {
        let device = &config.device;
        let mut adam = AdamW::new_lr(trainable.clone(), config.learning_rate)?;

        let pb = ProgressBar::new(config.num_epochs as u64);
        if !config.show_progress || config.verbose {
            pb.set_draw_target(ProgressDrawTarget::hidden());
        }

        if data.num_samples() == 0 {
            anyhow::bail!("no training examples");
        }
        let n_total = data.num_samples() as f64;

        let mut trace = TrainTrace {
            elbo_loss: vec![],
            validation_mae: vec![],
        };

        let mut step = 0usize;

        for epoch in 0..config.num_epochs {
            // fresh pass order every epoch
            data.shuffle_minibatch(config.batch_size)?;
            let minibatches = (0..data.num_minibatch())
                .map(|b| data.minibatch_shuffled(b, device))
                .collect::<anyhow::Result<Vec<_>>>()?;

            let mut loss_tot = 0f32;
            let mut num_updates = 0usize;

            for mb in minibatches.iter() {
                let llik = self.model.log_likelihood(&mb.input, &mb.output, true)?;
                let kl = self.model.kl_divergence()?;
                let loss = ((kl / n_total)? - llik.mean_all()?)?;

                let loss_val = loss.to_scalar::<f32>()?;
                if !loss_val.is_finite() {
                    warn!("[{}] skipping minibatch with non-finite loss", epoch + 1);
                    continue;
                }

                let mut grads = loss.backward()?;
                let mut grads_finite = true;
                for var in trainable.iter() {
                    if let Some(grad) = grads.remove(var) {
                        // checked before clamping; clamp saturates NaN to a bound
                        if !grad.sum_all()?.to_scalar::<f32>()?.is_finite() {
                            grads_finite = false;
                        }
                        grads.insert(var, grad.clamp(-config.grad_clip, config.grad_clip)?);
                    }
                }
                if !grads_finite {
                    warn!(
                        "[{}] skipping minibatch with non-finite gradients",
                        epoch + 1
                    );
                    continue;
                }
                adam.step(&grads)?;

                step += 1;
                if step % config.lr_decay_steps == 0 {
                    let lr = adam.learning_rate() * config.lr_decay_rate;
                    adam.set_learning_rate(lr);
                }

                loss_tot += loss_val;
                num_updates += 1;
            }

            trace
                .elbo_loss
                .push(loss_tot / num_updates.max(1) as f32);

            if let Some((x_val, y_val)) = validation {
                let mae = mean_absolute_error(self.model, x_val, y_val)?;
                trace.validation_mae.push(mae);
            }

            pb.inc(1);
            if config.verbose {
                match trace.validation_mae.last() {
                    Some(mae) => info!(
                        "[{}] elbo loss: {}, validation mae: {}",
                        epoch + 1,
                        trace.elbo_loss[epoch],
                        mae
                    ),
                    None => info!("[{}] elbo loss: {}", epoch + 1, trace.elbo_loss[epoch]),
                }
            }
        } // each epoch

        pb.finish_and_clear();
        Ok(trace)
    }
}

/// Deterministic mean-head prediction error on a held-out set
pub fn mean_absolute_error(
    model: &DensityNetwork,
    x_nd: &Tensor,
    y_n1: &Tensor,
) -> anyhow::Result<f32> {
    let preds = model.forward_t(x_nd, false)?;
    let mean_n1 = preds.narrow(1, 0, 1)?;
    Ok(mean_n1.sub(y_n1)?.abs()?.mean_all()?.to_scalar::<f32>()?)
}

/// Collect the variables whose names start with any of the prefixes
pub fn vars_with_prefix(variable_map: &VarMap, prefixes: &[&str]) -> Vec<Var> {
    let data = variable_map.data().lock().expect("variable map lock");
    let mut named: Vec<(&String, &Var)> = data
        .iter()
        .filter(|(name, _)| prefixes.iter().any(|p| name.starts_with(p)))
        .collect();
    named.sort_by_key(|(name, _)| name.to_string());
    named.into_iter().map(|(_, var)| var.clone()).collect()
}
