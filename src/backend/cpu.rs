//! CPU (scalar) backend: reference implementation. Deterministic,
//! single-threaded, plain nested loops — no SIMD, no threading. Every op
//! validates shapes up front and returns `BackendError` rather than
//! panicking; callers (the layers in `crate::layers`) annotate these with
//! layer context before surfacing them as `LayerError::RuntimeFailure`.

use crate::backend::{Backend, BackendError, BackendResult, Hw};
use crate::shape::Shape;
use crate::tensor::Tensor;
use rand::rngs::StdRng;
use rand::Rng;

/// CPU backend: plain loops, deterministic order, no allocator beneath the
/// kernels themselves (all ops write into a caller-supplied `dst`).
#[derive(Clone, Copy, Default)]
pub struct CpuBackend;

impl CpuBackend {
    pub fn new() -> Self {
        CpuBackend
    }
}

fn require_same_numel(a: &Tensor, b: &Tensor, op: &str) -> BackendResult<()> {
    if a.numel() != b.numel() {
        return Err(BackendError(format!(
            "{op}: numel mismatch {} != {}",
            a.numel(),
            b.numel()
        )));
    }
    Ok(())
}

fn coords_of(mut linear: usize, dims: &[usize]) -> Vec<usize> {
    let strides = Shape::new(dims.to_vec()).strides();
    let mut coords = vec![0usize; dims.len()];
    for (i, &s) in strides.iter().enumerate() {
        coords[i] = linear / s.max(1);
        linear %= s.max(1);
    }
    coords
}

fn linear_of(coords: &[usize], dims: &[usize]) -> usize {
    let strides = Shape::new(dims.to_vec()).strides();
    coords.iter().zip(strides.iter()).map(|(c, s)| c * s).sum()
}

impl Backend for CpuBackend {
    fn add(&self, a: &Tensor, b: &Tensor) -> BackendResult<Tensor> {
        require_same_numel(a, b, "add")?;
        let dst = Tensor::zeros(a.shape());
        self.add_into(&dst, a, b)?;
        Ok(dst)
    }

    fn add_into(&self, dst: &Tensor, a: &Tensor, b: &Tensor) -> BackendResult<()> {
        require_same_numel(a, b, "add_into")?;
        require_same_numel(dst, a, "add_into")?;
        let (ad, bd) = (a.data(), b.data());
        for ((d, x), y) in dst.data_mut().iter_mut().zip(ad.iter()).zip(bd.iter()) {
            *d = x + y;
        }
        Ok(())
    }

    fn sub_into(&self, dst: &Tensor, a: &Tensor, b: &Tensor) -> BackendResult<()> {
        require_same_numel(a, b, "sub_into")?;
        let (ad, bd) = (a.data(), b.data());
        for ((d, x), y) in dst.data_mut().iter_mut().zip(ad.iter()).zip(bd.iter()) {
            *d = x - y;
        }
        Ok(())
    }

    fn mul_into(&self, dst: &Tensor, a: &Tensor, b: &Tensor) -> BackendResult<()> {
        require_same_numel(a, b, "mul_into")?;
        let (ad, bd) = (a.data(), b.data());
        for ((d, x), y) in dst.data_mut().iter_mut().zip(ad.iter()).zip(bd.iter()) {
            *d = x * y;
        }
        Ok(())
    }

    fn div_into(&self, dst: &Tensor, a: &Tensor, b: &Tensor) -> BackendResult<()> {
        require_same_numel(a, b, "div_into")?;
        let (ad, bd) = (a.data(), b.data());
        for ((d, x), y) in dst.data_mut().iter_mut().zip(ad.iter()).zip(bd.iter()) {
            *d = x / y;
        }
        Ok(())
    }

    fn add_scaled_into(&self, dst: &Tensor, a: &Tensor, b: &Tensor, alpha: f32) -> BackendResult<()> {
        require_same_numel(a, b, "add_scaled_into")?;
        let (ad, bd) = (a.data(), b.data());
        for ((d, x), y) in dst.data_mut().iter_mut().zip(ad.iter()).zip(bd.iter()) {
            *d = x + alpha * y;
        }
        Ok(())
    }

    fn scale_into(&self, t: &Tensor, s: f32) -> BackendResult<()> {
        for x in t.data_mut().iter_mut() {
            *x *= s;
        }
        Ok(())
    }

    fn add_scalar_into(&self, dst: &Tensor, a: &Tensor, s: f32) -> BackendResult<()> {
        for (d, x) in dst.data_mut().iter_mut().zip(a.data().iter()) {
            *d = x + s;
        }
        Ok(())
    }

    fn square_into(&self, dst: &Tensor, a: &Tensor) -> BackendResult<()> {
        for (d, x) in dst.data_mut().iter_mut().zip(a.data().iter()) {
            *d = x * x;
        }
        Ok(())
    }

    fn sqrt_into(&self, dst: &Tensor, a: &Tensor) -> BackendResult<()> {
        for (d, x) in dst.data_mut().iter_mut().zip(a.data().iter()) {
            *d = x.sqrt();
        }
        Ok(())
    }

    fn exp_into(&self, dst: &Tensor, a: &Tensor) -> BackendResult<()> {
        for (d, x) in dst.data_mut().iter_mut().zip(a.data().iter()) {
            *d = x.exp();
        }
        Ok(())
    }

    fn log_into(&self, dst: &Tensor, a: &Tensor) -> BackendResult<()> {
        for (d, x) in dst.data_mut().iter_mut().zip(a.data().iter()) {
            *d = x.ln();
        }
        Ok(())
    }

    fn negative_into(&self, dst: &Tensor, a: &Tensor) -> BackendResult<()> {
        for (d, x) in dst.data_mut().iter_mut().zip(a.data().iter()) {
            *d = -x;
        }
        Ok(())
    }

    fn sum_all(&self, a: &Tensor) -> f32 {
        a.data().iter().sum()
    }

    fn mean_all(&self, a: &Tensor) -> f32 {
        let n = a.numel().max(1) as f32;
        self.sum_all(a) / n
    }

    fn sum_axis_into(&self, dst: &Tensor, a: &Tensor, axis: usize) -> BackendResult<()> {
        let dims = a.shape().dims();
        if axis >= dims.len() {
            return Err(BackendError(format!("sum_axis_into: axis {axis} out of range")));
        }
        dst.fill(0.0);
        let ad = a.data();
        let mut out_dims = dims.to_vec();
        out_dims[axis] = 1;
        for linear in 0..a.numel() {
            let mut coords = coords_of(linear, dims);
            coords[axis] = 0;
            let out_linear = linear_of(&coords, &out_dims);
            dst.data_mut()[out_linear] += ad[linear];
        }
        Ok(())
    }

    fn argmax_axis(&self, a: &Tensor, axis: usize) -> BackendResult<Tensor> {
        let dims = a.shape().dims();
        if axis >= dims.len() {
            return Err(BackendError(format!("argmax_axis: axis {axis} out of range")));
        }
        let mut out_dims = dims.to_vec();
        out_dims[axis] = 1;
        let out_numel: usize = out_dims.iter().product::<usize>().max(1);
        let mut best_val = vec![f32::NEG_INFINITY; out_numel];
        let mut best_idx = vec![0.0f32; out_numel];
        let ad = a.data();
        for linear in 0..a.numel() {
            let mut coords = coords_of(linear, dims);
            let k = coords[axis];
            coords[axis] = 0;
            let out_linear = linear_of(&coords, &out_dims);
            if ad[linear] > best_val[out_linear] {
                best_val[out_linear] = ad[linear];
                best_idx[out_linear] = k as f32;
            }
        }
        Tensor::from_vec(best_idx, Shape::new(out_dims)).map_err(|e| BackendError(e.to_string()))
    }

    fn greater_than_scalar_into(&self, dst: &Tensor, a: &Tensor, threshold: f32) -> BackendResult<()> {
        for (d, x) in dst.data_mut().iter_mut().zip(a.data().iter()) {
            *d = if *x > threshold { 1.0 } else { 0.0 };
        }
        Ok(())
    }

    fn where_into(&self, dst: &Tensor, cond: &Tensor, a: &Tensor, b: &Tensor) -> BackendResult<()> {
        require_same_numel(cond, a, "where_into")?;
        require_same_numel(a, b, "where_into")?;
        let (cd, ad, bd) = (cond.data(), a.data(), b.data());
        for (((d, c), x), y) in dst.data_mut().iter_mut().zip(cd.iter()).zip(ad.iter()).zip(bd.iter()) {
            *d = if *c != 0.0 { *x } else { *y };
        }
        Ok(())
    }

    fn matmul_into(&self, dst: &Tensor, a: &Tensor, b: &Tensor) -> BackendResult<()> {
        let (ad_s, bd_s) = (a.shape().dims(), b.shape().dims());
        if ad_s.len() != 2 || bd_s.len() != 2 {
            return Err(BackendError("matmul_into: requires 2D tensors".into()));
        }
        let (m, k1) = (ad_s[0], ad_s[1]);
        let (k2, n) = (bd_s[0], bd_s[1]);
        if k1 != k2 {
            return Err(BackendError(format!("matmul_into: dim mismatch {k1} != {k2}")));
        }
        let (ad, bd) = (a.data(), b.data());
        let mut out = dst.data_mut();
        for i in 0..m {
            for j in 0..n {
                let mut s = 0.0f32;
                for k in 0..k1 {
                    s += ad[i * k1 + k] * bd[k * n + j];
                }
                out[i * n + j] = s;
            }
        }
        Ok(())
    }

    fn matmul_nt_into(&self, dst: &Tensor, a: &Tensor, b: &Tensor) -> BackendResult<()> {
        let (ad_s, bd_s) = (a.shape().dims(), b.shape().dims());
        if ad_s.len() != 2 || bd_s.len() != 2 || ad_s[1] != bd_s[1] {
            return Err(BackendError("matmul_nt_into: shape mismatch".into()));
        }
        let (m, k) = (ad_s[0], ad_s[1]);
        let n = bd_s[0];
        let (ad, bd) = (a.data(), b.data());
        let mut out = dst.data_mut();
        for i in 0..m {
            for j in 0..n {
                let mut s = 0.0f32;
                for kk in 0..k {
                    s += ad[i * k + kk] * bd[j * k + kk];
                }
                out[i * n + j] = s;
            }
        }
        Ok(())
    }

    fn matmul_tn_into(&self, dst: &Tensor, a: &Tensor, b: &Tensor) -> BackendResult<()> {
        let (ad_s, bd_s) = (a.shape().dims(), b.shape().dims());
        if ad_s.len() != 2 || bd_s.len() != 2 || ad_s[0] != bd_s[0] {
            return Err(BackendError("matmul_tn_into: shape mismatch".into()));
        }
        let k = ad_s[0];
        let (m, n) = (ad_s[1], bd_s[1]);
        let (ad, bd) = (a.data(), b.data());
        let mut out = dst.data_mut();
        for i in 0..m {
            for j in 0..n {
                let mut s = 0.0f32;
                for kk in 0..k {
                    s += ad[kk * m + i] * bd[kk * n + j];
                }
                out[i * n + j] = s;
            }
        }
        Ok(())
    }

    fn transpose2d(&self, a: &Tensor) -> BackendResult<Tensor> {
        let d = a.shape().dims();
        if d.len() != 2 {
            return Err(BackendError("transpose2d: requires 2D tensor".into()));
        }
        let (m, n) = (d[0], d[1]);
        let ad = a.data();
        let mut out = vec![0.0f32; m * n];
        for i in 0..m {
            for j in 0..n {
                out[j * m + i] = ad[i * n + j];
            }
        }
        Tensor::from_vec(out, Shape::new(vec![n, m])).map_err(|e| BackendError(e.to_string()))
    }

    fn dot(&self, a: &Tensor, b: &Tensor) -> BackendResult<f32> {
        require_same_numel(a, b, "dot")?;
        Ok(a.data().iter().zip(b.data().iter()).map(|(x, y)| x * y).sum())
    }

    fn l2_normalize_into(&self, dst: &Tensor, a: &Tensor) -> BackendResult<()> {
        let norm = self.dot(a, a)?.sqrt().max(1e-12);
        self.scale_into(dst, 0.0)?; // ensure dst starts zeroed if aliasing differs
        for (d, x) in dst.data_mut().iter_mut().zip(a.data().iter()) {
            *d = x / norm;
        }
        Ok(())
    }

    fn add_bias_rows_into(&self, dst: &Tensor, mat: &Tensor, bias: &Tensor) -> BackendResult<()> {
        let md = mat.shape().dims();
        if md.len() != 2 || bias.shape().rank() != 1 || bias.shape().dims()[0] != md[1] {
            return Err(BackendError("add_bias_rows_into: shape mismatch".into()));
        }
        let (rows, cols) = (md[0], md[1]);
        let (matd, biasd) = (mat.data(), bias.data());
        let mut out = dst.data_mut();
        for i in 0..rows {
            for j in 0..cols {
                out[i * cols + j] = matd[i * cols + j] + biasd[j];
            }
        }
        Ok(())
    }

    fn sum_rows_into(&self, dst: &Tensor, mat: &Tensor) -> BackendResult<()> {
        let md = mat.shape().dims();
        if md.len() != 2 {
            return Err(BackendError("sum_rows_into: requires 2D tensor".into()));
        }
        let (rows, cols) = (md[0], md[1]);
        dst.fill(0.0);
        let matd = mat.data();
        let mut out = dst.data_mut();
        for i in 0..rows {
            for j in 0..cols {
                out[j] += matd[i * cols + j];
            }
        }
        Ok(())
    }

    fn relu_into(&self, dst: &Tensor, a: &Tensor) -> BackendResult<()> {
        for (d, x) in dst.data_mut().iter_mut().zip(a.data().iter()) {
            *d = x.max(0.0);
        }
        Ok(())
    }

    fn relu_backward_into(&self, dst: &Tensor, grad_out: &Tensor, input: &Tensor) -> BackendResult<()> {
        require_same_numel(grad_out, input, "relu_backward_into")?;
        let (gd, id) = (grad_out.data(), input.data());
        for ((d, g), x) in dst.data_mut().iter_mut().zip(gd.iter()).zip(id.iter()) {
            *d = if *x > 0.0 { *g } else { 0.0 };
        }
        Ok(())
    }

    fn sigmoid_into(&self, dst: &Tensor, a: &Tensor) -> BackendResult<()> {
        for (d, x) in dst.data_mut().iter_mut().zip(a.data().iter()) {
            *d = 1.0 / (1.0 + (-x).exp());
        }
        Ok(())
    }

    fn sigmoid_backward_into(&self, dst: &Tensor, grad_out: &Tensor, fwd_output: &Tensor) -> BackendResult<()> {
        require_same_numel(grad_out, fwd_output, "sigmoid_backward_into")?;
        let (gd, yd) = (grad_out.data(), fwd_output.data());
        for ((d, g), y) in dst.data_mut().iter_mut().zip(gd.iter()).zip(yd.iter()) {
            *d = g * y * (1.0 - y);
        }
        Ok(())
    }

    fn tanh_into(&self, dst: &Tensor, a: &Tensor) -> BackendResult<()> {
        for (d, x) in dst.data_mut().iter_mut().zip(a.data().iter()) {
            *d = x.tanh();
        }
        Ok(())
    }

    fn tanh_backward_into(&self, dst: &Tensor, grad_out: &Tensor, fwd_output: &Tensor) -> BackendResult<()> {
        require_same_numel(grad_out, fwd_output, "tanh_backward_into")?;
        let (gd, yd) = (grad_out.data(), fwd_output.data());
        for ((d, g), y) in dst.data_mut().iter_mut().zip(gd.iter()).zip(yd.iter()) {
            *d = g * (1.0 - y * y);
        }
        Ok(())
    }

    fn softmax_last_dim_into(&self, dst: &Tensor, a: &Tensor) -> BackendResult<()> {
        let dims = a.shape().dims();
        let c = *dims.last().ok_or_else(|| BackendError("softmax_last_dim_into: rank 0".into()))?;
        let rows = a.numel() / c.max(1);
        let ad = a.data();
        let mut out = dst.data_mut();
        for r in 0..rows {
            let row = &ad[r * c..r * c + c];
            let m = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
            let mut sum = 0.0f32;
            let out_row = &mut out[r * c..r * c + c];
            for (o, &x) in out_row.iter_mut().zip(row.iter()) {
                let e = (x - m).exp();
                *o = e;
                sum += e;
            }
            for o in out_row.iter_mut() {
                *o /= sum;
            }
        }
        Ok(())
    }

    fn softmax_backward_last_dim_into(&self, dst: &Tensor, grad_out: &Tensor, fwd_output: &Tensor) -> BackendResult<()> {
        require_same_numel(grad_out, fwd_output, "softmax_backward_last_dim_into")?;
        let dims = fwd_output.shape().dims();
        let c = *dims.last().ok_or_else(|| BackendError("softmax_backward_last_dim_into: rank 0".into()))?;
        let rows = fwd_output.numel() / c.max(1);
        let (gd, yd) = (grad_out.data(), fwd_output.data());
        let mut out = dst.data_mut();
        for r in 0..rows {
            let g_row = &gd[r * c..r * c + c];
            let y_row = &yd[r * c..r * c + c];
            let dot: f32 = g_row.iter().zip(y_row.iter()).map(|(g, y)| g * y).sum();
            let out_row = &mut out[r * c..r * c + c];
            for ((o, g), y) in out_row.iter_mut().zip(g_row.iter()).zip(y_row.iter()) {
                *o = y * (g - dot);
            }
        }
        Ok(())
    }

    fn dropout_mask(&self, shape: &Shape, p: f32, rng: &mut StdRng) -> Tensor {
        let scale = if p < 1.0 { 1.0 / (1.0 - p) } else { 0.0 };
        let t = Tensor::zeros(shape);
        for x in t.data_mut().iter_mut() {
            *x = if rng.gen::<f32>() < p { 0.0 } else { scale };
        }
        t
    }

    fn dropout_forward_into(&self, dst: &Tensor, a: &Tensor, mask: &Tensor) -> BackendResult<()> {
        self.mul_into(dst, a, mask)
    }

    fn dropout_backward_into(&self, dst: &Tensor, grad_out: &Tensor, mask: &Tensor) -> BackendResult<()> {
        self.mul_into(dst, grad_out, mask)
    }

    fn conv1d_into(&self, dst: &Tensor, input: &Tensor, kernels: &Tensor, stride: usize, pad: usize) -> BackendResult<()> {
        let id = input.shape().dims();
        let kd = kernels.shape().dims();
        if id.len() != 3 || kd.len() != 3 {
            return Err(BackendError("conv1d_into: requires rank-3 input and kernels".into()));
        }
        let (batch, in_ch, length) = (id[0], id[1], id[2]);
        let (out_ch, kin_ch, k) = (kd[0], kd[1], kd[2]);
        if kin_ch != in_ch {
            return Err(BackendError("conv1d_into: in_channels mismatch".into()));
        }
        let out_len = (length + 2 * pad).saturating_sub(k) / stride + 1;
        let (ind, kerd) = (input.data(), kernels.data());
        let mut out = dst.data_mut();
        for b in 0..batch {
            for co in 0..out_ch {
                for ol in 0..out_len {
                    let mut s = 0.0f32;
                    for ci in 0..in_ch {
                        for kk in 0..k {
                            let li = ol * stride + kk;
                            if li < pad || li - pad >= length {
                                continue;
                            }
                            let l = li - pad;
                            s += ind[(b * in_ch + ci) * length + l] * kerd[(co * in_ch + ci) * k + kk];
                        }
                    }
                    out[(b * out_ch + co) * out_len + ol] = s;
                }
            }
        }
        Ok(())
    }

    fn conv1d_kernel_grad(&self, grad_output: &Tensor, input: &Tensor, kernel_shape: &Shape, stride: usize, pad: usize) -> BackendResult<Tensor> {
        let id = input.shape().dims();
        let god = grad_output.shape().dims();
        let kd = kernel_shape.dims();
        let (batch, in_ch, length) = (id[0], id[1], id[2]);
        let (out_ch, k) = (kd[0], kd[2]);
        let out_len = god[2];
        let (ind, god_data) = (input.data(), grad_output.data());
        let mut grad_k = vec![0.0f32; out_ch * in_ch * k];
        for b in 0..batch {
            for co in 0..out_ch {
                for ol in 0..out_len {
                    let g = god_data[(b * out_ch + co) * out_len + ol];
                    if g == 0.0 {
                        continue;
                    }
                    for ci in 0..in_ch {
                        for kk in 0..k {
                            let li = ol * stride + kk;
                            if li < pad || li - pad >= length {
                                continue;
                            }
                            let l = li - pad;
                            grad_k[(co * in_ch + ci) * k + kk] += ind[(b * in_ch + ci) * length + l] * g;
                        }
                    }
                }
            }
        }
        Tensor::from_vec(grad_k, kernel_shape.clone()).map_err(|e| BackendError(e.to_string()))
    }

    fn conv1d_transpose_into(&self, dst: &Tensor, grad_output: &Tensor, kernels: &Tensor, stride: usize, pad: usize) -> BackendResult<()> {
        let dd = dst.shape().dims();
        let god = grad_output.shape().dims();
        let kd = kernels.shape().dims();
        let (batch, in_ch, length) = (dd[0], dd[1], dd[2]);
        let (out_ch, k) = (kd[0], kd[2]);
        let out_len = god[2];
        dst.fill(0.0);
        let (god_data, kerd) = (grad_output.data(), kernels.data());
        let mut out = dst.data_mut();
        for b in 0..batch {
            for co in 0..out_ch {
                for ol in 0..out_len {
                    let g = god_data[(b * out_ch + co) * out_len + ol];
                    if g == 0.0 {
                        continue;
                    }
                    for ci in 0..in_ch {
                        for kk in 0..k {
                            let li = ol * stride + kk;
                            if li < pad || li - pad >= length {
                                continue;
                            }
                            let l = li - pad;
                            out[(b * in_ch + ci) * length + l] += g * kerd[(co * in_ch + ci) * k + kk];
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn conv2d_into(&self, dst: &Tensor, input: &Tensor, kernels: &Tensor, stride: Hw, pad: Hw) -> BackendResult<()> {
        let id = input.shape().dims();
        let kd = kernels.shape().dims();
        if id.len() != 4 || kd.len() != 4 {
            return Err(BackendError("conv2d_into: requires rank-4 input and kernels".into()));
        }
        let (batch, in_ch, h, w) = (id[0], id[1], id[2], id[3]);
        let (out_ch, kin_ch, kh, kw) = (kd[0], kd[1], kd[2], kd[3]);
        if kin_ch != in_ch {
            return Err(BackendError("conv2d_into: in_channels mismatch".into()));
        }
        let (sh, sw) = stride;
        let (ph, pw) = pad;
        let out_h = (h + 2 * ph).saturating_sub(kh) / sh + 1;
        let out_w = (w + 2 * pw).saturating_sub(kw) / sw + 1;
        let (ind, kerd) = (input.data(), kernels.data());
        let mut out = dst.data_mut();
        for b in 0..batch {
            for co in 0..out_ch {
                for oh in 0..out_h {
                    for ow in 0..out_w {
                        let mut s = 0.0f32;
                        for ci in 0..in_ch {
                            for ky in 0..kh {
                                let hi = oh * sh + ky;
                                if hi < ph || hi - ph >= h {
                                    continue;
                                }
                                let hh = hi - ph;
                                for kx in 0..kw {
                                    let wi = ow * sw + kx;
                                    if wi < pw || wi - pw >= w {
                                        continue;
                                    }
                                    let ww = wi - pw;
                                    let iv = ind[((b * in_ch + ci) * h + hh) * w + ww];
                                    let kv = kerd[((co * in_ch + ci) * kh + ky) * kw + kx];
                                    s += iv * kv;
                                }
                            }
                        }
                        out[((b * out_ch + co) * out_h + oh) * out_w + ow] = s;
                    }
                }
            }
        }
        Ok(())
    }

    fn im2col(&self, input: &Tensor, kh: usize, kw: usize, stride: Hw, pad: Hw, out_hw: Hw) -> BackendResult<Tensor> {
        let id = input.shape().dims();
        if id.len() != 4 {
            return Err(BackendError("im2col: requires rank-4 input".into()));
        }
        let (batch, in_ch, h, w) = (id[0], id[1], id[2], id[3]);
        let (sh, sw) = stride;
        let (ph, pw) = pad;
        let (out_h, out_w) = out_hw;
        let cols_per_row = in_ch * kh * kw;
        let mut cols = vec![0.0f32; batch * out_h * out_w * cols_per_row];
        let ind = input.data();
        let mut row = 0usize;
        for b in 0..batch {
            for oh in 0..out_h {
                for ow in 0..out_w {
                    let base = row * cols_per_row;
                    let mut col = 0usize;
                    for ci in 0..in_ch {
                        for ky in 0..kh {
                            let hi = oh * sh + ky;
                            for kx in 0..kw {
                                let wi = ow * sw + kx;
                                let v = if hi >= ph && hi - ph < h && wi >= pw && wi - pw < w {
                                    let hh = hi - ph;
                                    let ww = wi - pw;
                                    ind[((b * in_ch + ci) * h + hh) * w + ww]
                                } else {
                                    0.0
                                };
                                cols[base + col] = v;
                                col += 1;
                            }
                        }
                    }
                    row += 1;
                }
            }
        }
        Tensor::from_vec(cols, Shape::new(vec![batch * out_h * out_w, cols_per_row]))
            .map_err(|e| BackendError(e.to_string()))
    }

    fn conv2d_kernel_grad(&self, grad_output: &Tensor, input: &Tensor, kernel_shape: &Shape, stride: Hw, pad: Hw) -> BackendResult<Tensor> {
        let kd = kernel_shape.dims();
        let (out_ch, in_ch, kh, kw) = (kd[0], kd[1], kd[2], kd[3]);
        let god = grad_output.shape().dims();
        let (batch, out_h, out_w) = (god[0], god[2], god[3]);
        let cols = self.im2col(input, kh, kw, stride, pad, (out_h, out_w))?;
        // grad_output is channels-second: [batch, out_ch, out_h, out_w]. The GEMM
        // needs row n=(b,oh,ow) paired with column co, so build [out_ch,
        // batch*out_h*out_w] by an explicit permuting gather rather than a raw
        // reshape (which would only coincide with this layout when out_ch==1 or
        // out_h*out_w==1).
        let hw = out_h * out_w;
        let god_data = grad_output.data();
        let mut grad_t_data = vec![0.0f32; out_ch * batch * hw];
        for b in 0..batch {
            for co in 0..out_ch {
                for p in 0..hw {
                    grad_t_data[co * (batch * hw) + b * hw + p] = god_data[(b * out_ch + co) * hw + p];
                }
            }
        }
        drop(god_data);
        let grad_t = Tensor::from_vec(grad_t_data, Shape::new(vec![out_ch, batch * hw]))
            .map_err(|e| BackendError(e.to_string()))?;
        let result = Tensor::zeros(&Shape::new(vec![out_ch, in_ch * kh * kw]));
        self.matmul_into(&result, &grad_t, &cols)?;
        result
            .reshape_copy(kernel_shape.clone())
            .map_err(|e| BackendError(e.to_string()))
    }

    fn conv2d_transpose_into(&self, dst: &Tensor, grad_output: &Tensor, kernels: &Tensor, stride: Hw, pad: Hw) -> BackendResult<()> {
        let dd = dst.shape().dims();
        let god = grad_output.shape().dims();
        let kd = kernels.shape().dims();
        let (batch, in_ch, h, w) = (dd[0], dd[1], dd[2], dd[3]);
        let (out_ch, kh, kw) = (kd[0], kd[2], kd[3]);
        let (out_h, out_w) = (god[2], god[3]);
        let (sh, sw) = stride;
        let (ph, pw) = pad;
        dst.fill(0.0);
        let (god_data, kerd) = (grad_output.data(), kernels.data());
        let mut out = dst.data_mut();
        for b in 0..batch {
            for co in 0..out_ch {
                for oh in 0..out_h {
                    for ow in 0..out_w {
                        let g = god_data[((b * out_ch + co) * out_h + oh) * out_w + ow];
                        if g == 0.0 {
                            continue;
                        }
                        for ci in 0..in_ch {
                            for ky in 0..kh {
                                let hi = oh * sh + ky;
                                if hi < ph || hi - ph >= h {
                                    continue;
                                }
                                let hh = hi - ph;
                                for kx in 0..kw {
                                    let wi = ow * sw + kx;
                                    if wi < pw || wi - pw >= w {
                                        continue;
                                    }
                                    let ww = wi - pw;
                                    let kv = kerd[((co * in_ch + ci) * kh + ky) * kw + kx];
                                    out[((b * in_ch + ci) * h + hh) * w + ww] += g * kv;
                                }
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn maxpool2d_with_indices_into(&self, dst: &Tensor, indices: &Tensor, input: &Tensor, k: Hw, stride: Hw, pad: Hw) -> BackendResult<()> {
        let id = input.shape().dims();
        let (batch, channels, h, w) = (id[0], id[1], id[2], id[3]);
        let (kh, kw) = k;
        let (sh, sw) = stride;
        let (ph, pw) = pad;
        let dd = dst.shape().dims();
        let (out_h, out_w) = (dd[2], dd[3]);
        let ind = input.data();
        let mut out = dst.data_mut();
        let mut idx = indices.data_mut();
        for b in 0..batch {
            for c in 0..channels {
                for oh in 0..out_h {
                    for ow in 0..out_w {
                        let mut best = f32::NEG_INFINITY;
                        let mut best_flat = 0usize;
                        for ky in 0..kh {
                            let hi = oh * sh + ky;
                            if hi < ph || hi - ph >= h {
                                continue;
                            }
                            let hh = hi - ph;
                            for kx in 0..kw {
                                let wi = ow * sw + kx;
                                if wi < pw || wi - pw >= w {
                                    continue;
                                }
                                let ww = wi - pw;
                                let flat = ((b * channels + c) * h + hh) * w + ww;
                                let v = ind[flat];
                                if v > best {
                                    best = v;
                                    best_flat = flat;
                                }
                            }
                        }
                        let out_flat = ((b * channels + c) * out_h + oh) * out_w + ow;
                        out[out_flat] = if best.is_finite() { best } else { 0.0 };
                        idx[out_flat] = best_flat as f32;
                    }
                }
            }
        }
        Ok(())
    }

    fn maxpool2d_backward_into(&self, dst_grad_input: &Tensor, grad_output: &Tensor, indices: &Tensor) -> BackendResult<()> {
        require_same_numel(grad_output, indices, "maxpool2d_backward_into")?;
        let (gd, idxd) = (grad_output.data(), indices.data());
        let mut din = dst_grad_input.data_mut();
        for (g, idx) in gd.iter().zip(idxd.iter()) {
            din[*idx as usize] += g;
        }
        Ok(())
    }

    fn avgpool2d_into(&self, dst: &Tensor, input: &Tensor, k: Hw, stride: Hw, pad: Hw) -> BackendResult<()> {
        let id = input.shape().dims();
        let (batch, channels, h, w) = (id[0], id[1], id[2], id[3]);
        let (kh, kw) = k;
        let (sh, sw) = stride;
        let (ph, pw) = pad;
        let dd = dst.shape().dims();
        let (out_h, out_w) = (dd[2], dd[3]);
        let ind = input.data();
        let mut out = dst.data_mut();
        let window = (kh * kw) as f32;
        for b in 0..batch {
            for c in 0..channels {
                for oh in 0..out_h {
                    for ow in 0..out_w {
                        let mut s = 0.0f32;
                        for ky in 0..kh {
                            let hi = oh * sh + ky;
                            if hi < ph || hi - ph >= h {
                                continue;
                            }
                            let hh = hi - ph;
                            for kx in 0..kw {
                                let wi = ow * sw + kx;
                                if wi < pw || wi - pw >= w {
                                    continue;
                                }
                                let ww = wi - pw;
                                s += ind[((b * channels + c) * h + hh) * w + ww];
                            }
                        }
                        out[((b * channels + c) * out_h + oh) * out_w + ow] = s / window;
                    }
                }
            }
        }
        Ok(())
    }

    fn avgpool2d_backward_into(&self, dst_grad_input: &Tensor, grad_output: &Tensor, k: Hw, stride: Hw, pad: Hw) -> BackendResult<()> {
        let dd = dst_grad_input.shape().dims();
        let (batch, channels, h, w) = (dd[0], dd[1], dd[2], dd[3]);
        let (kh, kw) = k;
        let (sh, sw) = stride;
        let (ph, pw) = pad;
        let god = grad_output.shape().dims();
        let (out_h, out_w) = (god[2], god[3]);
        dst_grad_input.fill(0.0);
        let gd = grad_output.data();
        let mut din = dst_grad_input.data_mut();
        let window = (kh * kw) as f32;
        for b in 0..batch {
            for c in 0..channels {
                for oh in 0..out_h {
                    for ow in 0..out_w {
                        let g = gd[((b * channels + c) * out_h + oh) * out_w + ow] / window;
                        for ky in 0..kh {
                            let hi = oh * sh + ky;
                            if hi < ph || hi - ph >= h {
                                continue;
                            }
                            let hh = hi - ph;
                            for kx in 0..kw {
                                let wi = ow * sw + kx;
                                if wi < pw || wi - pw >= w {
                                    continue;
                                }
                                let ww = wi - pw;
                                din[((b * channels + c) * h + hh) * w + ww] += g;
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn global_avgpool2d_into(&self, dst: &Tensor, input: &Tensor) -> BackendResult<()> {
        let id = input.shape().dims();
        let (batch, channels, h, w) = (id[0], id[1], id[2], id[3]);
        let ind = input.data();
        let mut out = dst.data_mut();
        let hw = (h * w) as f32;
        for b in 0..batch {
            for c in 0..channels {
                let mut s = 0.0f32;
                for hh in 0..h {
                    for ww in 0..w {
                        s += ind[((b * channels + c) * h + hh) * w + ww];
                    }
                }
                out[b * channels + c] = s / hw;
            }
        }
        Ok(())
    }

    fn global_avgpool2d_backward_into(&self, dst_grad_input: &Tensor, grad_output: &Tensor) -> BackendResult<()> {
        let dd = dst_grad_input.shape().dims();
        let (batch, channels, h, w) = (dd[0], dd[1], dd[2], dd[3]);
        let gd = grad_output.data();
        let mut din = dst_grad_input.data_mut();
        let hw = (h * w) as f32;
        for b in 0..batch {
            for c in 0..channels {
                let g = gd[b * channels + c] / hw;
                for hh in 0..h {
                    for ww in 0..w {
                        din[((b * channels + c) * h + hh) * w + ww] = g;
                    }
                }
            }
        }
        Ok(())
    }

    fn pad_into(&self, dst: &Tensor, input: &Tensor, padding: &[(usize, usize)], value: f32) -> BackendResult<()> {
        let in_dims = input.shape().dims();
        if padding.len() != in_dims.len() {
            return Err(BackendError("pad_into: padding rank mismatch".into()));
        }
        let out_dims = dst.shape().dims().to_vec();
        dst.fill(value);
        let ind = input.data();
        for linear in 0..input.numel() {
            let coords = coords_of(linear, in_dims);
            let out_coords: Vec<usize> = coords
                .iter()
                .enumerate()
                .map(|(d, &c)| c + padding[d].0)
                .collect();
            let out_linear = linear_of(&out_coords, &out_dims);
            dst.data_mut()[out_linear] = ind[linear];
        }
        Ok(())
    }

    fn pad_backward_into(&self, dst_grad_input: &Tensor, grad_output: &Tensor, padding: &[(usize, usize)]) -> BackendResult<()> {
        let in_dims = dst_grad_input.shape().dims().to_vec();
        let out_dims = grad_output.shape().dims();
        if padding.len() != in_dims.len() {
            return Err(BackendError("pad_backward_into: padding rank mismatch".into()));
        }
        let god = grad_output.data();
        for linear in 0..dst_grad_input.numel() {
            let coords = coords_of(linear, &in_dims);
            let out_coords: Vec<usize> = coords
                .iter()
                .enumerate()
                .map(|(d, &c)| c + padding[d].0)
                .collect();
            let out_linear = linear_of(&out_coords, out_dims);
            dst_grad_input.data_mut()[linear] = god[out_linear];
        }
        Ok(())
    }

    fn concat_into(&self, dst: &Tensor, inputs: &[&Tensor], dim: usize) -> BackendResult<()> {
        let out_dims = dst.shape().dims().to_vec();
        if dim >= out_dims.len() {
            return Err(BackendError("concat_into: dim out of range".into()));
        }
        let mut offset = 0usize;
        for input in inputs {
            let in_dims = input.shape().dims().to_vec();
            let ind = input.data();
            for linear in 0..input.numel() {
                let mut coords = coords_of(linear, &in_dims);
                coords[dim] += offset;
                let out_linear = linear_of(&coords, &out_dims);
                dst.data_mut()[out_linear] = ind[linear];
            }
            offset += in_dims[dim];
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::Shape;

    #[test]
    fn matmul_into_basic() {
        let b = CpuBackend::new();
        let a = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], Shape::new(vec![2, 2])).unwrap();
        let w = Tensor::from_vec(vec![1.0, 0.0, 0.0, 1.0], Shape::new(vec![2, 2])).unwrap();
        let dst = Tensor::zeros(&Shape::new(vec![2, 2]));
        b.matmul_into(&dst, &a, &w).unwrap();
        assert_eq!(dst.to_vec(), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn softmax_uniform_on_zero_input() {
        let b = CpuBackend::new();
        let a = Tensor::from_vec(vec![0.0, 0.0, 0.0], Shape::new(vec![3])).unwrap();
        let dst = Tensor::zeros(a.shape());
        b.softmax_last_dim_into(&dst, &a).unwrap();
        for v in dst.to_vec() {
            assert!((v - 1.0 / 3.0).abs() < 1e-6);
        }
    }

    #[test]
    fn conv1d_matches_worked_example() {
        let b = CpuBackend::new();
        let input = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], Shape::new(vec![1, 1, 4])).unwrap();
        let kernel = Tensor::from_vec(vec![1.0, 1.0], Shape::new(vec![1, 1, 2])).unwrap();
        let dst = Tensor::zeros(&Shape::new(vec![1, 1, 3]));
        b.conv1d_into(&dst, &input, &kernel, 1, 0).unwrap();
        assert_eq!(dst.to_vec(), vec![3.0, 5.0, 7.0]);
    }

    #[test]
    fn maxpool_matches_worked_example() {
        let b = CpuBackend::new();
        #[rustfmt::skip]
        let input = Tensor::from_vec(
            vec![
                1.0, 2.0, 3.0, 4.0,
                5.0, 6.0, 7.0, 8.0,
                9.0, 10.0, 11.0, 12.0,
                13.0, 14.0, 15.0, 16.0,
            ],
            Shape::new(vec![1, 1, 4, 4]),
        )
        .unwrap();
        let dst = Tensor::zeros(&Shape::new(vec![1, 1, 2, 2]));
        let indices = Tensor::zeros(&Shape::new(vec![1, 1, 2, 2]));
        b.maxpool2d_with_indices_into(&dst, &indices, &input, (2, 2), (2, 2), (0, 0))
            .unwrap();
        assert_eq!(dst.to_vec(), vec![6.0, 8.0, 14.0, 16.0]);

        let grad_out = Tensor::ones(&Shape::new(vec![1, 1, 2, 2]));
        let grad_in = Tensor::zeros(&Shape::new(vec![1, 1, 4, 4]));
        b.maxpool2d_backward_into(&grad_in, &grad_out, &indices).unwrap();
        let expected_flat_idx = [5usize, 7, 13, 15];
        let g = grad_in.to_vec();
        for (i, v) in g.iter().enumerate() {
            if expected_flat_idx.contains(&i) {
                assert_eq!(*v, 1.0);
            } else {
                assert_eq!(*v, 0.0);
            }
        }
    }
}
