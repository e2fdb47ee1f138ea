use candle_core::{Device, Tensor};
use ndarray::Array2;
use rand::prelude::SliceRandom;
use rayon::prelude::*;

pub struct MinibatchData {
    pub input: Tensor,
    pub output: Tensor,
}

/// `DataLoader` for minibatch learning
pub trait DataLoader {
    fn minibatch_shuffled(
        &self,
        batch_idx: usize,
        target_device: &Device,
    ) -> anyhow::Result<MinibatchData>;

    fn num_minibatch(&self) -> usize;

    /// Total number of training examples (the `N` in the ELBO rescaling)
    fn num_samples(&self) -> usize;

    fn shuffle_minibatch(&mut self, batch_size: usize) -> anyhow::Result<()>;
}

///
/// A simple data loader for in-memory 2d matrices. Each row is one
/// example; inputs are feature rows, outputs are (1 x 1) targets.
///
pub struct InMemoryData {
    input_data: Vec<Tensor>,
    output_data: Vec<Tensor>,

    shuffled_input_data: Option<Vec<Tensor>>,
    shuffled_output_data: Option<Vec<Tensor>>,

    minibatches: Minibatches,
}

impl InMemoryData {
    ///
    /// Create a data loader with input rows `data` and targets `out`
    ///
    pub fn new_with_output<D>(data: &D, out: &D) -> anyhow::Result<Self>
    where
        D: RowsToTensorVec,
    {
        let data = data.rows_to_tensor_vec();
        let out_data = out.rows_to_tensor_vec();

        if data.len() != out_data.len() {
            anyhow::bail!(
                "input rows = {} but output rows = {}",
                data.len(),
                out_data.len()
            );
        }

        let rows = (0..data.len()).collect();

        Ok(InMemoryData {
            input_data: data,
            output_data: out_data,
            shuffled_input_data: None,
            shuffled_output_data: None,
            minibatches: Minibatches {
                samples: rows,
                chunks: vec![],
            },
        })
    }
}

impl DataLoader for InMemoryData {
    fn minibatch_shuffled(
        &self,
        batch_idx: usize,
        target_device: &Device,
    ) -> anyhow::Result<MinibatchData> {
        let input = take_shuffled(batch_idx, target_device, self.shuffled_input_data.as_ref())?;
        let output = take_shuffled(batch_idx, target_device, self.shuffled_output_data.as_ref())?;
        Ok(MinibatchData { input, output })
    }

    fn num_minibatch(&self) -> usize {
        self.minibatches.chunks.len()
    }

    fn num_samples(&self) -> usize {
        self.input_data.len()
    }

    fn shuffle_minibatch(&mut self, batch_size: usize) -> anyhow::Result<()> {
        self.minibatches.shuffle_minibatch(batch_size)?;

        // preload all the shuffled minibatches
        let mut shuffled_input = Vec::with_capacity(self.num_minibatch());
        let mut shuffled_output = Vec::with_capacity(self.num_minibatch());

        for samples in self.minibatches.chunks.iter() {
            let chunk: Vec<Tensor> = samples.iter().map(|&i| self.input_data[i].clone()).collect();
            shuffled_input.push(Tensor::cat(&chunk, 0)?);

            let chunk: Vec<Tensor> = samples
                .iter()
                .map(|&i| self.output_data[i].clone())
                .collect();
            shuffled_output.push(Tensor::cat(&chunk, 0)?);
        }

        self.shuffled_input_data = Some(shuffled_input);
        self.shuffled_output_data = Some(shuffled_output);
        Ok(())
    }
}

fn take_shuffled(
    batch_idx: usize,
    target_device: &Device,
    data_vec: Option<&Vec<Tensor>>,
) -> anyhow::Result<Tensor> {
    let data_vec = data_vec.ok_or_else(|| anyhow::anyhow!("need to shuffle data"))?;
    if data_vec.len() <= batch_idx {
        anyhow::bail!(
            "invalid index = {} vs. total # = {}",
            batch_idx,
            data_vec.len()
        );
    }
    Ok(data_vec[batch_idx].to_device(target_device)?)
}

///
/// A helper `struct` for shuffling and creating minibatch indexes;
/// after `shuffle_minibatch` is called, `chunks` partition indexes.
///
pub struct Minibatches {
    samples: Vec<usize>,
    pub chunks: Vec<Vec<usize>>,
}

impl Minibatches {
    pub fn shuffle_minibatch(&mut self, batch_size: usize) -> anyhow::Result<()> {
        if batch_size == 0 {
            anyhow::bail!("batch size must be positive");
        }

        let mut rng = rand::rng();
        self.samples.shuffle(&mut rng);
        self.chunks = self
            .samples
            .chunks(batch_size)
            .map(|chunk| chunk.to_vec())
            .collect();
        Ok(())
    }
}

///
/// Convert rows of a matrix to a vector of `Tensor`
///
pub trait RowsToTensorVec {
    fn rows_to_tensor_vec(&self) -> Vec<Tensor>;
}

impl RowsToTensorVec for Array2<f32> {
    fn rows_to_tensor_vec(&self) -> Vec<Tensor> {
        let mut idx_data = self
            .axis_iter(ndarray::Axis(0))
            .enumerate()
            .par_bridge()
            .map(|(i, row)| {
                let mut v = Tensor::from_iter(row.iter().copied(), &Device::Cpu)
                    .expect("failed to create tensor");
                v = v.reshape((1, row.len())).expect("failed to reshape");
                (i, v)
            })
            .collect::<Vec<_>>();

        idx_data.sort_by_key(|(i, _)| *i);
        idx_data.into_iter().map(|(_, t)| t).collect()
    }
}

impl RowsToTensorVec for Tensor {
    fn rows_to_tensor_vec(&self) -> Vec<Tensor> {
        (0..self.dims()[0])
            .map(|i| self.narrow(0, i, 1).expect("failed to take row"))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_distr::{Distribution, Uniform};

    #[test]
    fn shuffled_chunks_partition_all_rows() -> anyhow::Result<()> {
        let unif = Uniform::new(0f32, 1f32).expect("unif [0, 1)");
        let mut rng = rand::rng();
        let x: Array2<f32> = Array2::from_shape_fn((13, 4), |_| unif.sample(&mut rng));
        let y: Array2<f32> = Array2::from_shape_fn((13, 1), |_| unif.sample(&mut rng));

        let mut data = InMemoryData::new_with_output(&x, &y)?;
        data.shuffle_minibatch(5)?;

        assert_eq!(data.num_samples(), 13);
        assert_eq!(data.num_minibatch(), 3);

        let mut seen = 0;
        for b in 0..data.num_minibatch() {
            let mb = data.minibatch_shuffled(b, &Device::Cpu)?;
            assert_eq!(mb.input.dims()[1], 4);
            assert_eq!(mb.output.dims()[1], 1);
            assert_eq!(mb.input.dims()[0], mb.output.dims()[0]);
            seen += mb.input.dims()[0];
        }
        assert_eq!(seen, 13);
        Ok(())
    }

    #[test]
    fn reshuffling_changes_the_pass_order() -> anyhow::Result<()> {
        // rows are distinguishable by their first value
        let x: Array2<f32> = Array2::from_shape_fn((13, 2), |(i, _)| i as f32);
        let y: Array2<f32> = Array2::zeros((13, 1));
        let mut data = InMemoryData::new_with_output(&x, &y)?;

        let pass_order = |data: &InMemoryData| -> anyhow::Result<Vec<f32>> {
            let mut order = vec![];
            for b in 0..data.num_minibatch() {
                let mb = data.minibatch_shuffled(b, &Device::Cpu)?;
                for row in mb.input.to_vec2::<f32>()? {
                    order.push(row[0]);
                }
            }
            Ok(order)
        };

        data.shuffle_minibatch(4)?;
        let first = pass_order(&data)?;
        data.shuffle_minibatch(4)?;
        let second = pass_order(&data)?;

        // identical permutations twice in a row are vanishingly unlikely
        assert_ne!(first, second);
        Ok(())
    }

    #[test]
    fn mismatched_rows_rejected() {
        let x = Array2::<f32>::zeros((5, 3));
        let y = Array2::<f32>::zeros((4, 1));
        assert!(InMemoryData::new_with_output(&x, &y).is_err());
    }
}
