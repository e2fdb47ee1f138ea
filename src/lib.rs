pub mod cli;
pub mod data_loader;
pub mod density_network;
pub mod features;
pub mod io;
pub mod model_traits;
pub mod trainer;
pub mod uncertainty;
pub mod variational_linear;
pub mod variational_stack;

pub use candle_core;
pub use candle_nn;
