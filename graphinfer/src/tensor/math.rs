//! Elementwise arithmetic on constant tensors, used by the fusion rules to
//! fold BatchNormalization/Mul/Add parameters into Conv weights.

use anyhow::{anyhow, Result};

use super::dtype::DType;
use super::tensor::Tensor;

fn check_float(tensor: &Tensor) -> Result<()> {
    if !tensor.dtype().is_float() {
        return Err(anyhow!(
            "constant arithmetic requires a float tensor, got {}",
            tensor.dtype()
        ));
    }
    Ok(())
}

fn map_unary(tensor: &mut Tensor, f: impl Fn(f64) -> f64) -> Result<()> {
    check_float(tensor)?;
    match tensor.dtype() {
        DType::F32 => {
            for v in tensor.as_slice_mut::<f32>()? {
                *v = f(*v as f64) as f32;
            }
        }
        DType::F64 => {
            for v in tensor.as_slice_mut::<f64>()? {
                *v = f(*v);
            }
        }
        _ => unreachable!(),
    }
    Ok(())
}

fn map_binary(lhs: &mut Tensor, rhs: &Tensor, f: impl Fn(f64, f64) -> f64) -> Result<()> {
    check_float(lhs)?;
    if lhs.dtype() != rhs.dtype() {
        return Err(anyhow!(
            "constant arithmetic dtype mismatch: {} vs {}",
            lhs.dtype(),
            rhs.dtype()
        ));
    }
    let scalar_rhs = rhs.numel() == 1;
    if !scalar_rhs && lhs.numel() != rhs.numel() {
        return Err(anyhow!(
            "constant arithmetic length mismatch: {} vs {}",
            lhs.numel(),
            rhs.numel()
        ));
    }
    match lhs.dtype() {
        DType::F32 => {
            let rhs = rhs.as_slice::<f32>()?.to_vec();
            for (i, v) in lhs.as_slice_mut::<f32>()?.iter_mut().enumerate() {
                let r = if scalar_rhs { rhs[0] } else { rhs[i] };
                *v = f(*v as f64, r as f64) as f32;
            }
        }
        DType::F64 => {
            let rhs = rhs.as_slice::<f64>()?.to_vec();
            for (i, v) in lhs.as_slice_mut::<f64>()?.iter_mut().enumerate() {
                let r = if scalar_rhs { rhs[0] } else { rhs[i] };
                *v = f(*v, r);
            }
        }
        _ => unreachable!(),
    }
    Ok(())
}

impl Tensor {
    pub fn add_assign(&mut self, other: &Tensor) -> Result<()> {
        map_binary(self, other, |a, b| a + b)
    }

    pub fn sub_assign(&mut self, other: &Tensor) -> Result<()> {
        map_binary(self, other, |a, b| a - b)
    }

    pub fn mul_assign(&mut self, other: &Tensor) -> Result<()> {
        map_binary(self, other, |a, b| a * b)
    }

    pub fn div_assign(&mut self, other: &Tensor) -> Result<()> {
        map_binary(self, other, |a, b| a / b)
    }

    pub fn add_scalar(&mut self, value: f64) -> Result<()> {
        map_unary(self, |a| a + value)
    }

    pub fn sqrt_inplace(&mut self) -> Result<()> {
        map_unary(self, f64::sqrt)
    }

    /// Scale every element of output channel `c` by `factors[c]`.
    ///
    /// `self` is laid out `[C, ...]`; `factors` holds either one value per
    /// channel or a single scalar applied to all channels.
    pub fn scale_by_channel(&mut self, factors: &Tensor) -> Result<()> {
        check_float(self)?;
        if self.dtype() != factors.dtype() {
            return Err(anyhow!(
                "constant arithmetic dtype mismatch: {} vs {}",
                self.dtype(),
                factors.dtype()
            ));
        }
        let channels = *self
            .shape()
            .first()
            .ok_or_else(|| anyhow!("scale_by_channel requires rank >= 1"))?;
        let scalar = factors.numel() == 1;
        if !scalar && factors.numel() != channels {
            return Err(anyhow!(
                "expected {} channel factors, got {}",
                channels,
                factors.numel()
            ));
        }
        let block = if channels == 0 { 0 } else { self.numel() / channels };
        match self.dtype() {
            DType::F32 => {
                let factors = factors.as_slice::<f32>()?.to_vec();
                let data = self.as_slice_mut::<f32>()?;
                for c in 0..channels {
                    let s = if scalar { factors[0] } else { factors[c] };
                    for v in &mut data[c * block..(c + 1) * block] {
                        *v *= s;
                    }
                }
            }
            DType::F64 => {
                let factors = factors.as_slice::<f64>()?.to_vec();
                let data = self.as_slice_mut::<f64>()?;
                for c in 0..channels {
                    let s = if scalar { factors[0] } else { factors[c] };
                    for v in &mut data[c * block..(c + 1) * block] {
                        *v *= s;
                    }
                }
            }
            _ => unreachable!(),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::tensor::Tensor;

    #[test]
    fn channel_scaling_applies_per_block() -> anyhow::Result<()> {
        // [2, 2] weight, factors [10, 100].
        let mut w = Tensor::from_vec(vec![1.0f32, 2.0, 3.0, 4.0], &[2, 2])?;
        let s = Tensor::from_vec(vec![10.0f32, 100.0], &[2])?;
        w.scale_by_channel(&s)?;
        assert_eq!(w.to_vec::<f32>()?, vec![10.0, 20.0, 300.0, 400.0]);
        Ok(())
    }

    #[test]
    fn scalar_factor_broadcasts() -> anyhow::Result<()> {
        let mut w = Tensor::from_vec(vec![1.0f32, 2.0, 3.0, 4.0], &[2, 2])?;
        let s = Tensor::from_vec(vec![0.5f32], &[1])?;
        w.scale_by_channel(&s)?;
        assert_eq!(w.to_vec::<f32>()?, vec![0.5, 1.0, 1.5, 2.0]);
        Ok(())
    }

    #[test]
    fn binary_ops_reject_length_mismatch() -> anyhow::Result<()> {
        let mut a = Tensor::from_vec(vec![1.0f32, 2.0], &[2])?;
        let b = Tensor::from_vec(vec![1.0f32, 2.0, 3.0], &[3])?;
        assert!(a.add_assign(&b).is_err());
        Ok(())
    }
}
