//! AdamW with per-parameter weight decay.

use candle_core::{Result, Tensor, Var};

/// Substrings that exclude a parameter from weight decay.
pub const NO_DECAY_NAMES: &[&str] = &["bias", "layernorm.weight", "norm.weight"];

pub fn uses_weight_decay(name: &str) -> bool {
    !NO_DECAY_NAMES.iter().any(|nd| name.contains(nd))
}

/// One optimized tensor.
pub struct Param {
    pub name: String,
    pub var: Var,
    pub weight_decay: f64,
    exp_avg: Tensor,
    exp_avg_sq: Tensor,
}

/// Decoupled weight decay Adam.
///
/// Update rule (t = step count after increment):
///   1. p *= 1 - lr * wd
///   2. m = b1*m + (1-b1)*g,  v = b2*v + (1-b2)*g^2
///   3. p -= lr * (m / (1-b1^t)) / (sqrt(v / (1-b2^t)) + eps)
pub struct AdamW {
    params: Vec<Param>,
    pub lr: f64,
    beta1: f64,
    beta2: f64,
    eps: f64,
    t: usize,
}

impl AdamW {
    /// `named_vars` must be in a stable order: gradients are matched by index.
    pub fn new(
        named_vars: Vec<(String, Var)>,
        lr: f64,
        betas: (f64, f64),
        eps: f64,
        weight_decay: f64,
    ) -> Result<Self> {
        let params = named_vars
            .into_iter()
            .map(|(name, var)| {
                let weight_decay = if uses_weight_decay(&name) {
                    weight_decay
                } else {
                    0.0
                };
                Ok(Param {
                    exp_avg: Tensor::zeros_like(var.as_tensor())?,
                    exp_avg_sq: Tensor::zeros_like(var.as_tensor())?,
                    name,
                    var,
                    weight_decay,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            params,
            lr,
            beta1: betas.0,
            beta2: betas.1,
            eps,
            t: 0,
        })
    }

    pub fn params(&self) -> &[Param] {
        &self.params
    }

    pub fn steps_taken(&self) -> usize {
        self.t
    }

    /// Apply one update. `grads[i]` belongs to `params()[i]`; `None` skips it.
    pub fn step(&mut self, grads: &[Option<Tensor>]) -> Result<()> {
        if grads.len() != self.params.len() {
            candle_core::bail!(
                "AdamW got {} gradients for {} parameters",
                grads.len(),
                self.params.len()
            );
        }
        self.t += 1;
        let bias1 = 1.0 - self.beta1.powi(self.t as i32);
        let bias2 = 1.0 - self.beta2.powi(self.t as i32);

        for (p, grad) in self.params.iter_mut().zip(grads) {
            let Some(grad) = grad else { continue };

            if p.weight_decay > 0.0 {
                let decayed = (p.var.as_tensor() * (1.0 - self.lr * p.weight_decay))?;
                p.var.set(&decayed)?;
            }

            p.exp_avg = ((&p.exp_avg * self.beta1)? + (grad * (1.0 - self.beta1))?)?;
            p.exp_avg_sq = ((&p.exp_avg_sq * self.beta2)? + (grad.sqr()? * (1.0 - self.beta2))?)?;

            let m_hat = (&p.exp_avg / bias1)?;
            let denom = ((&p.exp_avg_sq / bias2)?.sqrt()? + self.eps)?;
            let update = ((m_hat / denom)? * self.lr)?;
            p.var.set(&p.var.as_tensor().sub(&update)?)?;
        }
        Ok(())
    }

    pub fn set_lr(&mut self, lr: f64) {
        self.lr = lr;
    }
}

/// Global L2 norm over all present gradients.
pub fn global_grad_norm(grads: &[Option<Tensor>]) -> Result<f64> {
    let mut sq = 0.0f64;
    for g in grads.iter().flatten() {
        sq += g.sqr()?.sum_all()?.to_dtype(candle_core::DType::F64)?.to_scalar::<f64>()?;
    }
    Ok(sq.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::{VarBuilder, VarMap};

    #[test]
    fn test_decay_groups_by_name() {
        assert!(uses_weight_decay("blocks.0.attention.wq.weight"));
        assert!(!uses_weight_decay("score_head.bias"));
        assert!(!uses_weight_decay("blocks.0.attn_norm.weight"));
        assert!(!uses_weight_decay("final_norm.weight"));
    }

    #[test]
    fn test_first_step_moves_by_lr() -> Result<()> {
        // With bias correction the first Adam step is lr * sign(g) (up to eps).
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let w = vb.get_with_hints(3, "w", candle_nn::Init::Const(1.0))?;
        let named = vec![("w".to_string(), varmap.all_vars()[0].clone())];
        let mut opt = AdamW::new(named, 0.1, (0.9, 0.999), 1e-8, 0.0)?;

        let grad = Tensor::new(&[2.0f32, -3.0, 0.0], &device)?;
        opt.step(&[Some(grad)])?;
        let vals = w.to_vec1::<f32>()?;
        assert!((vals[0] - 0.9).abs() < 1e-4);
        assert!((vals[1] - 1.1).abs() < 1e-4);
        assert!((vals[2] - 1.0).abs() < 1e-4);
        assert_eq!(opt.steps_taken(), 1);
        Ok(())
    }

    #[test]
    fn test_weight_decay_only_on_decay_group() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let w = vb.get_with_hints(2, "proj.weight", candle_nn::Init::Const(1.0))?;
        let b = vb.get_with_hints(2, "proj.bias", candle_nn::Init::Const(1.0))?;
        let data = varmap.data().lock().unwrap();
        let mut named: Vec<_> = data.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        drop(data);
        named.sort_by(|a, b| a.0.cmp(&b.0));
        let mut opt = AdamW::new(named, 0.1, (0.9, 0.999), 1e-8, 0.5)?;

        let zero = Tensor::zeros(2, DType::F32, &device)?;
        opt.step(&[Some(zero.clone()), Some(zero)])?;
        assert!((w.to_vec1::<f32>()?[0] - 0.95).abs() < 1e-6);
        assert!((b.to_vec1::<f32>()?[0] - 1.0).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_global_norm() -> Result<()> {
        let device = Device::Cpu;
        let g1 = Tensor::new(&[3.0f32], &device)?;
        let g2 = Tensor::new(&[4.0f32], &device)?;
        let n = global_grad_norm(&[Some(g1), None, Some(g2)])?;
        assert!((n - 5.0).abs() < 1e-9);
        Ok(())
    }
}
