use candle_core::{Device, Tensor};
use flate2::read::GzDecoder;
use ndarray::Array2;
use rayon::prelude::*;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

///
/// Open a buffered reader over a plain or gzipped file
///
pub fn open_buf_reader(input_file_path: &Path) -> anyhow::Result<Box<dyn BufRead>> {
    let file = File::open(input_file_path)?;

    let is_gz = input_file_path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("gz"))
        .unwrap_or(false);

    if is_gz {
        Ok(Box::new(BufReader::new(GzDecoder::new(file))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

///
/// Read a delimited (comma, tab or whitespace) numeric matrix, either
/// gzipped or not. Comment lines (`#` or `%`) are skipped and a single
/// non-numeric header line is tolerated; every data row must have the
/// same number of columns.
///
pub fn read_matrix_f32(input_file_path: &Path) -> anyhow::Result<Array2<f32>> {
    let buf = open_buf_reader(input_file_path)?;

    let lines_raw: Vec<String> = buf
        .lines()
        .collect::<std::io::Result<Vec<_>>>()?
        .into_iter()
        .filter(|line| {
            let trimmed = line.trim();
            !trimmed.is_empty() && !trimmed.starts_with('#') && !trimmed.starts_with('%')
        })
        .collect();

    if lines_raw.is_empty() {
        anyhow::bail!("no data lines in {:?}", input_file_path);
    }

    let parse_row = |line: &String| -> Option<Vec<f32>> {
        line.split([',', '\t', ' '])
            .filter(|tok| !tok.is_empty())
            .map(|tok| tok.parse::<f32>().ok())
            .collect()
    };

    // a leading header of column names parses to None and is dropped
    let skip_header = parse_row(&lines_raw[0]).is_none();
    let data_lines = if skip_header {
        &lines_raw[1..]
    } else {
        &lines_raw[..]
    };

    let rows: Vec<Vec<f32>> = data_lines
        .par_iter()
        .map(|line| {
            parse_row(line).ok_or_else(|| anyhow::anyhow!("non-numeric value in line: {}", line))
        })
        .collect::<anyhow::Result<_>>()?;

    if rows.is_empty() {
        anyhow::bail!("no data rows in {:?}", input_file_path);
    }

    let ncols = rows[0].len();
    if rows.iter().any(|r| r.len() != ncols) {
        anyhow::bail!("ragged rows in {:?}", input_file_path);
    }

    let nrows = rows.len();
    let flat: Vec<f32> = rows.into_iter().flatten().collect();
    Ok(Array2::from_shape_vec((nrows, ncols), flat)?)
}

///
/// Read a delimited numeric matrix directly into a 2d tensor
///
pub fn read_tensor_f32(input_file_path: &Path, device: &Device) -> anyhow::Result<Tensor> {
    let mat = read_matrix_f32(input_file_path)?;
    let (nrows, ncols) = mat.dim();
    let flat: Vec<f32> = mat.into_raw_vec_and_offset().0;
    Ok(Tensor::from_vec(flat, (nrows, ncols), device)?)
}
