//! Optimizers with per-group learning rates and state that can be written
//! into a checkpoint and restored on resume.

use candle_core::backprop::GradStore;
use candle_core::{bail, DType, Device, Result, Tensor, Var};
use std::collections::HashMap;

/// Named parameters sharing one learning rate.
pub struct ParamGroup {
    pub params: Vec<(String, Var)>,
    pub lr: f64,
}

pub trait Optimizer {
    fn step(&mut self, grads: &GradStore) -> Result<()>;

    fn backward_step(&mut self, loss: &Tensor) -> Result<()> {
        let grads = loss.backward()?;
        self.step(&grads)
    }

    /// Internal state keyed by `<param name>.<buffer>`.
    fn state_dict(&self) -> Result<HashMap<String, Tensor>>;

    fn load_state_dict(&mut self, state: &HashMap<String, Tensor>) -> Result<()>;
}

fn zeros_like(var: &Var) -> Result<Var> {
    Var::zeros(var.shape(), var.dtype(), var.device())
}

fn sign(xs: &Tensor) -> Result<Tensor> {
    let dtype = xs.dtype();
    xs.gt(0.)?.to_dtype(dtype)? - xs.lt(0.)?.to_dtype(dtype)?
}

fn restore(buffer: &Var, state: &HashMap<String, Tensor>, key: &str) -> Result<()> {
    match state.get(key) {
        Some(t) => buffer.set(&t.to_dtype(buffer.dtype())?.to_device(buffer.device())?),
        None => bail!("optimizer state has no entry {key}"),
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ParamsLion {
    pub beta1: f64,
    pub beta2: f64,
    pub weight_decay: f64,
}

impl Default for ParamsLion {
    fn default() -> Self {
        Self {
            beta1: 0.9,
            beta2: 0.99,
            weight_decay: 0.0,
        }
    }
}

struct LionSlot {
    name: String,
    var: Var,
    lr: f64,
    exp_avg: Var,
}

/// Sign-momentum optimizer (Chen et al., "Symbolic Discovery of
/// Optimization Algorithms").
pub struct Lion {
    slots: Vec<LionSlot>,
    params: ParamsLion,
}

impl Lion {
    pub fn new(groups: Vec<ParamGroup>, params: ParamsLion) -> Result<Self> {
        let mut slots = Vec::new();
        for group in groups {
            for (name, var) in group.params {
                if !var.dtype().is_float() {
                    continue;
                }
                let exp_avg = zeros_like(&var)?;
                slots.push(LionSlot {
                    name,
                    var,
                    lr: group.lr,
                    exp_avg,
                });
            }
        }
        Ok(Self { slots, params })
    }
}

impl Optimizer for Lion {
    fn step(&mut self, grads: &GradStore) -> Result<()> {
        let ParamsLion {
            beta1,
            beta2,
            weight_decay,
        } = self.params;
        for slot in self.slots.iter() {
            let Some(g) = grads.get(&slot.var) else {
                continue;
            };
            let theta = if weight_decay > 0. {
                (slot.var.as_tensor() * (1. - slot.lr * weight_decay))?
            } else {
                slot.var.as_tensor().clone()
            };
            let m = slot.exp_avg.as_tensor();
            let update = sign(&((m * beta1)? + (g * (1. - beta1))?)?)?;
            slot.var.set(&(theta - (update * slot.lr)?)?)?;
            slot.exp_avg.set(&((m * beta2)? + (g * (1. - beta2))?)?)?;
        }
        Ok(())
    }

    fn state_dict(&self) -> Result<HashMap<String, Tensor>> {
        self.slots
            .iter()
            .map(|s| Ok((format!("{}.exp_avg", s.name), s.exp_avg.as_tensor().copy()?)))
            .collect()
    }

    fn load_state_dict(&mut self, state: &HashMap<String, Tensor>) -> Result<()> {
        for slot in self.slots.iter() {
            restore(&slot.exp_avg, state, &format!("{}.exp_avg", slot.name))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ParamsAdam {
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub weight_decay: f64,
    /// Keep the running maximum of the second moment (AMSGrad).
    pub amsgrad: bool,
}

impl Default for ParamsAdam {
    fn default() -> Self {
        Self {
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.0,
            amsgrad: false,
        }
    }
}

struct AdamSlot {
    name: String,
    var: Var,
    lr: f64,
    exp_avg: Var,
    exp_avg_sq: Var,
    max_exp_avg_sq: Option<Var>,
}

pub struct Adam {
    slots: Vec<AdamSlot>,
    params: ParamsAdam,
    step_t: u64,
}

impl Adam {
    pub fn new(groups: Vec<ParamGroup>, params: ParamsAdam) -> Result<Self> {
        let mut slots = Vec::new();
        for group in groups {
            for (name, var) in group.params {
                if !var.dtype().is_float() {
                    continue;
                }
                let max_exp_avg_sq = match params.amsgrad {
                    true => Some(zeros_like(&var)?),
                    false => None,
                };
                slots.push(AdamSlot {
                    name,
                    lr: group.lr,
                    exp_avg: zeros_like(&var)?,
                    exp_avg_sq: zeros_like(&var)?,
                    max_exp_avg_sq,
                    var,
                });
            }
        }
        Ok(Self {
            slots,
            params,
            step_t: 0,
        })
    }

    #[cfg(test)]
    pub fn steps(&self) -> u64 {
        self.step_t
    }
}

impl Optimizer for Adam {
    fn step(&mut self, grads: &GradStore) -> Result<()> {
        self.step_t += 1;
        let ParamsAdam {
            beta1,
            beta2,
            eps,
            weight_decay,
            ..
        } = self.params;
        let bias_correction1 = 1. - beta1.powi(self.step_t as i32);
        let bias_correction2_sqrt = (1. - beta2.powi(self.step_t as i32)).sqrt();
        for slot in self.slots.iter() {
            let Some(g) = grads.get(&slot.var) else {
                continue;
            };
            let g = if weight_decay != 0. {
                (g + (slot.var.as_tensor() * weight_decay)?)?
            } else {
                g.clone()
            };
            let m = ((slot.exp_avg.as_tensor() * beta1)? + (&g * (1. - beta1))?)?;
            let v = ((slot.exp_avg_sq.as_tensor() * beta2)? + (g.sqr()? * (1. - beta2))?)?;
            let v_hat = match &slot.max_exp_avg_sq {
                Some(max) => {
                    let v_max = max.as_tensor().maximum(&v)?;
                    max.set(&v_max)?;
                    v_max
                }
                None => v.clone(),
            };
            let denom = ((v_hat.sqrt()? / bias_correction2_sqrt)? + eps)?;
            let update = ((&m / &denom)? * (slot.lr / bias_correction1))?;
            slot.var.set(&(slot.var.as_tensor() - update)?)?;
            slot.exp_avg.set(&m)?;
            slot.exp_avg_sq.set(&v)?;
        }
        Ok(())
    }

    fn state_dict(&self) -> Result<HashMap<String, Tensor>> {
        let mut state = HashMap::new();
        state.insert(
            "step".to_string(),
            Tensor::new(&[self.step_t as i64], &Device::Cpu)?,
        );
        for s in self.slots.iter() {
            state.insert(format!("{}.exp_avg", s.name), s.exp_avg.as_tensor().copy()?);
            state.insert(
                format!("{}.exp_avg_sq", s.name),
                s.exp_avg_sq.as_tensor().copy()?,
            );
            if let Some(max) = &s.max_exp_avg_sq {
                state.insert(format!("{}.max_exp_avg_sq", s.name), max.as_tensor().copy()?);
            }
        }
        Ok(state)
    }

    fn load_state_dict(&mut self, state: &HashMap<String, Tensor>) -> Result<()> {
        let Some(step) = state.get("step") else {
            bail!("optimizer state has no entry step")
        };
        let step = step.to_dtype(DType::I64)?.flatten_all()?.to_vec1::<i64>()?;
        self.step_t = step.first().copied().unwrap_or(0).max(0) as u64;
        for slot in self.slots.iter() {
            restore(&slot.exp_avg, state, &format!("{}.exp_avg", slot.name))?;
            restore(&slot.exp_avg_sq, state, &format!("{}.exp_avg_sq", slot.name))?;
            if let Some(max) = &slot.max_exp_avg_sq {
                restore(max, state, &format!("{}.max_exp_avg_sq", slot.name))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimizes (w - 3)^2 from w = 0 and returns the final w.
    fn descend<O: Optimizer>(w: &Var, opt: &mut O, steps: usize) -> f32 {
        for _ in 0..steps {
            let loss = (w.as_tensor() - 3.).unwrap().sqr().unwrap().sum_all().unwrap();
            opt.backward_step(&loss).unwrap();
        }
        w.as_tensor().to_vec1::<f32>().unwrap()[0]
    }

    fn param(name: &str) -> (String, Var) {
        let var = Var::zeros(1, DType::F32, &Device::Cpu).unwrap();
        (name.to_string(), var)
    }

    #[test]
    fn lion_moves_by_lr_per_step() {
        let (name, w) = param("w");
        let group = ParamGroup {
            params: vec![(name, w.clone())],
            lr: 0.1,
        };
        let mut opt = Lion::new(vec![group], ParamsLion::default()).unwrap();
        let after = descend(&w, &mut opt, 5);
        assert!((after - 0.5).abs() < 1e-5, "{after}");
    }

    #[test]
    fn amsgrad_adam_converges() {
        let (name, w) = param("w");
        let group = ParamGroup {
            params: vec![(name, w.clone())],
            lr: 0.1,
        };
        let params = ParamsAdam {
            amsgrad: true,
            ..Default::default()
        };
        let mut opt = Adam::new(vec![group], params).unwrap();
        let after = descend(&w, &mut opt, 300);
        assert!((after - 3.).abs() < 0.1, "{after}");
        assert_eq!(opt.steps(), 300);
    }

    #[test]
    fn groups_keep_their_own_learning_rate() {
        let (a_name, a) = param("transformer.w");
        let (b_name, b) = param("head.w");
        let groups = vec![
            ParamGroup {
                params: vec![(a_name, a.clone())],
                lr: 0.001,
            },
            ParamGroup {
                params: vec![(b_name, b.clone())],
                lr: 0.1,
            },
        ];
        let mut opt = Lion::new(groups, ParamsLion::default()).unwrap();
        let loss = ((a.as_tensor() - 3.).unwrap().sqr().unwrap()
            + (b.as_tensor() - 3.).unwrap().sqr().unwrap())
        .unwrap()
        .sum_all()
        .unwrap();
        opt.backward_step(&loss).unwrap();
        let a = a.as_tensor().to_vec1::<f32>().unwrap()[0];
        let b = b.as_tensor().to_vec1::<f32>().unwrap()[0];
        assert!((a - 0.001).abs() < 1e-6);
        assert!((b - 0.1).abs() < 1e-6);
    }

    #[test]
    fn adam_state_round_trips() {
        let (name, w) = param("w");
        let params = ParamsAdam {
            amsgrad: true,
            ..Default::default()
        };
        let group = |var: &Var| ParamGroup {
            params: vec![(name.clone(), var.clone())],
            lr: 0.1,
        };
        let mut opt = Adam::new(vec![group(&w)], params).unwrap();
        descend(&w, &mut opt, 3);
        let state = opt.state_dict().unwrap();
        assert!(state.contains_key("w.max_exp_avg_sq"));

        let mut restored = Adam::new(vec![group(&w)], params).unwrap();
        restored.load_state_dict(&state).unwrap();
        assert_eq!(restored.steps(), 3);
        let a = state["w.exp_avg"].to_vec1::<f32>().unwrap();
        let b = restored.state_dict().unwrap()["w.exp_avg"]
            .to_vec1::<f32>()
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn missing_state_entry_is_an_error() {
        let (name, w) = param("w");
        let group = ParamGroup {
            params: vec![(name, w)],
            lr: 0.1,
        };
        let mut opt = Lion::new(vec![group], ParamsLion::default()).unwrap();
        assert!(opt.load_state_dict(&HashMap::new()).is_err());
    }
}
