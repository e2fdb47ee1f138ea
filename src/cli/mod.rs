pub mod predict;
pub mod train;

use clap::{Parser, Subcommand};

pub use predict::PredictArgs;
pub use train::TrainArgs;

#[derive(Parser)]
#[command(name = "milpa")]
#[command(about = "Bayesian crop-yield density network: training and prediction")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Train the dual-head density network by ELBO optimization
    Train(TrainArgs),
    /// Predict yield and uncertainty with a trained network
    Predict(PredictArgs),
}

pub fn select_device(gpu: bool) -> candle_core::Device {
    if gpu {
        #[cfg(target_os = "macos")]
        {
            candle_core::Device::new_metal(0).unwrap_or(candle_core::Device::Cpu)
        }
        #[cfg(target_os = "linux")]
        {
            candle_core::Device::new_cuda(0).unwrap_or(candle_core::Device::Cpu)
        }
        #[cfg(not(any(target_os = "macos", target_os = "linux")))]
        {
            candle_core::Device::Cpu
        }
    } else {
        candle_core::Device::Cpu
    }
}
