use crate::cli::select_device;
use crate::density_network::DensityNetwork;
use crate::features::{assemble_features, model_input, MODEL_INPUT_DIM, NUM_ENGINEERED_FEATURES};
use crate::io::read_tensor_f32;
use crate::uncertainty::sample_predictive;

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use clap::Args;
use log::info;
use serde::Serialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

#[derive(Args, Debug)]
pub struct PredictArgs {
    #[arg(short, long, help = "Trained weights (safetensors)")]
    pub weights: PathBuf,

    #[arg(
        short,
        long,
        help = "Input: a JSON feature map from the feature-extraction service, \
                or a delimited matrix with one example per row"
    )]
    pub features: PathBuf,

    #[arg(long, help = "Target year, prepended to the engineered features")]
    pub year: Option<f32>,

    #[arg(long, value_delimiter = ',', default_value = "256,128")]
    pub trunk_dims: Vec<usize>,

    #[arg(long, value_delimiter = ',', default_value = "64,32,1")]
    pub head_dims: Vec<usize>,

    #[arg(long, default_value = "100", help = "Monte-Carlo sample count")]
    pub samples: usize,

    #[arg(
        long,
        help = "Skip Monte-Carlo sampling and report point predictions \
                from the posterior means only"
    )]
    pub deterministic: bool,

    #[arg(long)]
    pub gpu: bool,
}

/// One deterministic (mean, dispersion) pair per example
#[derive(Serialize)]
struct PointPrediction {
    prediction: f32,
    dispersion: f32,
}

fn is_json(path: &PathBuf) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}

fn load_input(args: &PredictArgs, device: &Device) -> Result<Tensor> {
    if is_json(&args.features) {
        let year = args
            .year
            .ok_or_else(|| anyhow::anyhow!("--year is required with a JSON feature map"))?;
        let reader = BufReader::new(File::open(&args.features)?);
        let values: HashMap<String, Option<f32>> = serde_json::from_reader(reader)?;
        let engineered = assemble_features(&values);
        model_input(year, &engineered, device)
    } else {
        let x = read_tensor_f32(&args.features, device)?;
        let width = x.dim(1)?;
        if width == MODEL_INPUT_DIM {
            Ok(x)
        } else if width == NUM_ENGINEERED_FEATURES {
            let year = args.year.ok_or_else(|| {
                anyhow::anyhow!("--year is required for a {}-wide matrix", width)
            })?;
            let n = x.dim(0)?;
            let year_col = Tensor::full(year, (n, 1), device)?;
            let pad_col = Tensor::zeros((n, 1), DType::F32, device)?;
            Ok(Tensor::cat(&[year_col, pad_col, x], 1)?)
        } else {
            anyhow::bail!(
                "input has {} columns; expected {} (full) or {} (engineered features)",
                width,
                MODEL_INPUT_DIM,
                NUM_ENGINEERED_FEATURES
            )
        }
    }
}

pub fn run(args: &PredictArgs) -> Result<()> {
    let device = select_device(args.gpu);
    info!("Using device: {:?}", device);

    let x = load_input(args, &device)?;
    info!("Input shape: {:?}", x.dims());

    let mut trunk_dims = vec![x.dim(1)?];
    trunk_dims.extend_from_slice(&args.trunk_dims);

    let mut varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let model = DensityNetwork::new(&trunk_dims, &args.head_dims, vb)?;

    info!("Loading weights from {:?}", args.weights);
    varmap.load(&args.weights)?;

    if args.deterministic {
        let points: Vec<PointPrediction> = model
            .point_predictions(&x)?
            .into_iter()
            .map(|(prediction, dispersion)| PointPrediction {
                prediction,
                dispersion,
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&points)?);
        return Ok(());
    }

    let summary = sample_predictive(&model, &x, args.samples)?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
