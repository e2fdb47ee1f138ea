use crate::cli::select_device;
use crate::data_loader::InMemoryData;
use crate::density_network::DensityNetwork;
use crate::io::read_matrix_f32;
use crate::trainer::{TrainConfig, Trainer};

use anyhow::Result;
use candle_core::{DType, Tensor};
use candle_nn::{VarBuilder, VarMap};
use clap::Args;
use log::info;
use ndarray::{Array2, Axis};
use rand::prelude::SliceRandom;
use std::path::PathBuf;

#[derive(Args, Debug)]
pub struct TrainArgs {
    #[arg(short, long, help = "Feature matrix, one example per row (csv/tsv, optionally gzipped)")]
    pub x: PathBuf,

    #[arg(short, long, help = "Target yields, one value per row")]
    pub y: PathBuf,

    #[arg(long, value_delimiter = ',', default_value = "256,128")]
    pub trunk_dims: Vec<usize>,

    #[arg(long, value_delimiter = ',', default_value = "64,32,1")]
    pub head_dims: Vec<usize>,

    #[arg(long, default_value = "0.2", help = "Held-out fraction for per-epoch MAE monitoring")]
    pub validation_fraction: f32,

    #[arg(long, default_value = "100")]
    pub epochs: usize,

    #[arg(long, default_value = "32")]
    pub batch_size: usize,

    #[arg(long, default_value = "0.001")]
    pub lr: f64,

    #[arg(long, default_value = "0.5")]
    pub grad_clip: f64,

    #[arg(long, help = "Initialize from previously saved weights")]
    pub init: Option<PathBuf>,

    #[arg(long, help = "Update head parameters only (transfer learning; requires --init)")]
    pub freeze_trunk: bool,

    #[arg(short, long, help = "Output path for the trained weights (safetensors)")]
    pub output: PathBuf,

    #[arg(long)]
    pub gpu: bool,

    #[arg(short, long)]
    pub verbose: bool,
}

fn split_rows(x: &Array2<f32>, fraction: f32) -> Result<(Vec<usize>, Vec<usize>)> {
    if !(0.0..1.0).contains(&fraction) {
        anyhow::bail!("validation fraction must be in [0, 1), got {}", fraction);
    }

    let n = x.nrows();
    let n_val = ((n as f32) * fraction).round() as usize;
    if n_val >= n {
        anyhow::bail!(
            "validation fraction {} leaves no training rows (n = {})",
            fraction,
            n
        );
    }

    let mut indices: Vec<usize> = (0..n).collect();
    indices.shuffle(&mut rand::rng());
    let val = indices[..n_val].to_vec();
    let train = indices[n_val..].to_vec();
    Ok((train, val))
}

pub fn run(args: &TrainArgs) -> Result<()> {
    let device = select_device(args.gpu);
    info!("Using device: {:?}", device);

    info!("Loading X from {:?}", args.x);
    let x = read_matrix_f32(&args.x)?;
    info!("  X shape: {:?}", x.dim());

    info!("Loading Y from {:?}", args.y);
    let y = read_matrix_f32(&args.y)?;
    info!("  Y shape: {:?}", y.dim());

    if x.nrows() != y.nrows() {
        anyhow::bail!("X and Y must have the same number of rows");
    }
    if y.ncols() != 1 {
        anyhow::bail!("Y must have exactly one column, got {}", y.ncols());
    }
    if args.freeze_trunk && args.init.is_none() {
        anyhow::bail!("--freeze-trunk needs pretrained weights (--init)");
    }

    let mut trunk_dims = vec![x.ncols()];
    trunk_dims.extend_from_slice(&args.trunk_dims);

    let mut varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let model = DensityNetwork::new(&trunk_dims, &args.head_dims, vb)?;
    info!(
        "Built density network: trunk {:?}, heads {:?}",
        trunk_dims, args.head_dims
    );

    if let Some(ref init) = args.init {
        info!("Loading pretrained weights from {:?}", init);
        varmap.load(init)?;
    }

    let (train_idx, val_idx) = split_rows(&x, args.validation_fraction)?;
    info!(
        "Training on {} examples, validating on {}",
        train_idx.len(),
        val_idx.len()
    );

    let x_train = x.select(Axis(0), &train_idx);
    let y_train = y.select(Axis(0), &train_idx);
    let mut data = InMemoryData::new_with_output(&x_train, &y_train)?;

    let validation = if val_idx.is_empty() {
        None
    } else {
        let x_val = x.select(Axis(0), &val_idx);
        let y_val = y.select(Axis(0), &val_idx);
        let (n, d) = x_val.dim();
        Some((
            Tensor::from_vec(x_val.into_raw_vec_and_offset().0, (n, d), &device)?,
            Tensor::from_vec(y_val.into_raw_vec_and_offset().0, (n, 1), &device)?,
        ))
    };

    let config = TrainConfig {
        learning_rate: args.lr,
        batch_size: args.batch_size,
        num_epochs: args.epochs,
        grad_clip: args.grad_clip,
        device: device.clone(),
        verbose: args.verbose,
        ..TrainConfig::default()
    };

    let mut trainer = Trainer::new(&model, &varmap);
    let validation_ref = validation.as_ref().map(|(x, y)| (x, y));

    let trace = if args.freeze_trunk {
        info!("Trunk frozen; training head parameters only");
        trainer.train_heads_only(&mut data, validation_ref, &config)?
    } else {
        trainer.train(&mut data, validation_ref, &config)?
    };

    if let Some(last) = trace.elbo_loss.last() {
        info!("Final elbo loss: {}", last);
    }
    if let Some(last) = trace.validation_mae.last() {
        info!("Final validation mae: {}", last);
    }

    varmap.save(&args.output)?;
    info!("Saved weights to {:?}", args.output);
    Ok(())
}
