//! Weight-only int8 quantization.
//!
//! Each output row of a `[out_features, in_features]` weight gets its own scale,
//! chosen so the row's largest magnitude maps to 127. Zero points are always 0
//! (symmetric), which lets a consumer rebuild the float weight with a single
//! `DequantizeLinear` along axis 0.

use crate::Error;
use crate::tensor::{Shape, TensorData, TensorDataValue};

pub const QUANTIZATION_SCHEME: &str = "int8-symmetric-per-row";

const QMAX: f32 = 127.0;

pub struct QuantizedWeight {
    /// int8 `[rows, cols]`
    pub values: TensorData,
    /// f32 `[rows]`
    pub scales: TensorData,
    /// int8 `[rows]`, all zero
    pub zero_points: TensorData,
}

pub fn quantize_per_row(weight: &TensorData) -> Result<QuantizedWeight, Error> {
    let dims = weight.shape().resolve()?;
    let [rows, cols] = dims[..] else {
        return Err(Error::InputShapeError(format!("cannot quantize rank-{} weight per row", dims.len())));
    };
    if rows == 0 || cols == 0 {
        return Err(Error::InputShapeError(format!("cannot quantize empty weight {}", weight.shape())));
    }
    let values = weight.value().to_f32_vec()?;

    let mut quantized = Vec::with_capacity(values.len());
    let mut scales = Vec::with_capacity(rows);
    for row in values.chunks_exact(cols) {
        let max_abs = row.iter().fold(0.0f32, |acc, x| acc.max(x.abs()));
        let scale = if max_abs > 0.0 && max_abs.is_finite() { max_abs / QMAX } else { 1.0 };
        quantized.extend(row.iter().map(|x| (x / scale).round().clamp(-QMAX, QMAX) as i8));
        scales.push(scale);
    }

    Ok(QuantizedWeight {
        values: TensorData::new(TensorDataValue::I8(quantized), weight.shape().clone())?,
        scales: TensorData::new(TensorDataValue::F32(scales), Shape::from(vec![rows]))?,
        zero_points: TensorData::fill(Shape::from(vec![rows]), 0i8)?,
    })
}
