//! Policy inference: TorchScript module loading, masked sampling, LSTM state.
//!
//! The trainer exports a single scripted module serving all twelve heroes
//! (hero identity rides in the self-vector one-hot). The server polls the
//! artifact's mtime and hot-swaps the module between cycles.

use std::error::Error;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::time::SystemTime;

use tch::{CModule, Device, IValue, Kind, TchError, Tensor};

use crate::constants::{
    ALLY_DIM, ENEMY_DIM, GLOBAL_DIM, GRID_CHANNELS, GRID_H, GRID_W, HIDDEN_DIM,
    NUM_DISCRETE_HEADS, SELF_DIM,
};
use crate::encoder::{AgentObs, MaskSet};

const MODEL_FILE: &str = "model_latest.pt";
const LOG_2PI: f64 = 1.837_877_066_409_345_3;

/// Inference failure for a single hero. The orchestrator substitutes a
/// default step and carries on; one bad forward cannot poison the instance.
#[derive(Debug)]
pub enum InferError {
    Torch(TchError),
    Output(&'static str),
}

impl fmt::Display for InferError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            InferError::Torch(e) => write!(f, "torch error: {}", e),
            InferError::Output(what) => write!(f, "bad model output: {}", what),
        }
    }
}

impl Error for InferError {}

impl From<TchError> for InferError {
    fn from(e: TchError) -> Self {
        InferError::Torch(e)
    }
}

/// LSTM hidden pair for one hero, shape (1, 1, HIDDEN_DIM) each.
#[derive(Debug)]
pub struct HiddenState {
    pub h: Tensor,
    pub c: Tensor,
}

impl HiddenState {
    pub fn zeros(device: Device) -> Self {
        let shape = [1, 1, HIDDEN_DIM as i64];
        HiddenState {
            h: Tensor::zeros(shape, (Kind::Float, device)),
            c: Tensor::zeros(shape, (Kind::Float, device)),
        }
    }

    /// Cheap alias of the pair. Safe because hidden tensors are replaced
    /// wholesale after each forward, never mutated in place.
    pub fn alias(&self) -> Self {
        HiddenState {
            h: self.h.shallow_clone(),
            c: self.c.shallow_clone(),
        }
    }

    /// Flatten both sides to CPU f32 vectors for rollout storage.
    pub fn to_vecs(&self) -> Result<(Vec<f32>, Vec<f32>), TchError> {
        let flatten = |t: &Tensor| -> Result<Vec<f32>, TchError> {
            let flat = t.detach().to_device(Device::Cpu).reshape([-1]);
            Vec::<f32>::try_from(&flat)
        };
        Ok((flatten(&self.h)?, flatten(&self.c)?))
    }
}

/// One hero's sampled step: eleven discrete selections in canonical head
/// order, two continuous pairs, and the scalars the trainer needs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeroStep {
    pub discrete: [i64; NUM_DISCRETE_HEADS],
    pub move_xy: [f32; 2],
    pub point_xy: [f32; 2],
    pub log_prob: f32,
    pub value: f32,
}

impl HeroStep {
    /// The no-model fallback: all-zero actions keep the wire contract alive
    /// before the trainer has produced a first artifact.
    pub fn default_step() -> Self {
        HeroStep {
            discrete: [0; NUM_DISCRETE_HEADS],
            move_xy: [0.0; 2],
            point_xy: [0.0; 2],
            log_prob: 0.0,
            value: 0.0,
        }
    }
}

/// Resolve a `--device` string, falling back to CPU when CUDA is requested
/// but absent.
pub fn resolve_device(requested: &str) -> Device {
    match requested {
        "cuda" => {
            if tch::Cuda::is_available() {
                Device::Cuda(0)
            } else {
                tracing::warn!("cuda requested but unavailable, using cpu");
                Device::Cpu
            }
        }
        _ => Device::Cpu,
    }
}

pub struct InferenceEngine {
    model: Option<CModule>,
    model_mtime: Option<SystemTime>,
    model_dir: PathBuf,
    device: Device,
}

impl InferenceEngine {
    pub fn new(model_dir: impl Into<PathBuf>, device: Device) -> Self {
        let mut engine = InferenceEngine {
            model: None,
            model_mtime: None,
            model_dir: model_dir.into(),
            device,
        };
        if !engine.try_load() {
            tracing::info!(
                dir = %engine.model_dir.display(),
                "no model artifact yet, serving default actions"
            );
        }
        engine
    }

    pub fn has_model(&self) -> bool {
        self.model.is_some()
    }

    pub fn init_hidden(&self) -> HiddenState {
        HiddenState::zeros(self.device)
    }

    fn model_path(&self) -> PathBuf {
        self.model_dir.join(MODEL_FILE)
    }

    fn try_load(&mut self) -> bool {
        let path = self.model_path();
        let mtime = match fs::metadata(&path).and_then(|m| m.modified()) {
            Ok(t) => t,
            Err(_) => return false,
        };
        match CModule::load_on_device(&path, self.device) {
            Ok(mut module) => {
                module.set_eval();
                self.model = Some(module);
                self.model_mtime = Some(mtime);
                tracing::info!(path = %path.display(), "loaded policy module");
                true
            }
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "failed to load policy module");
                false
            }
        }
    }

    /// Reload iff the artifact's mtime moved since the last successful load.
    pub fn maybe_reload(&mut self) {
        let path = self.model_path();
        let mtime = match fs::metadata(&path).and_then(|m| m.modified()) {
            Ok(t) => t,
            Err(_) => return,
        };
        if self.model.is_none() || self.model_mtime != Some(mtime) {
            tracing::info!(path = %path.display(), "model artifact changed, reloading");
            self.try_load();
        }
    }

    /// Run one hero through the policy. Returns the sampled step and the
    /// post-step hidden pair; with no model loaded, returns the default step
    /// and the hidden pair unchanged.
    pub fn infer_hero(
        &self,
        obs: &AgentObs,
        masks: &MaskSet,
        agent: usize,
        hidden: &HiddenState,
    ) -> Result<(HeroStep, HiddenState), InferError> {
        let Some(model) = &self.model else {
            return Ok((HeroStep::default_step(), hidden.alias()));
        };

        let mut inputs = Vec::with_capacity(7 + NUM_DISCRETE_HEADS);
        inputs.push(IValue::Tensor(
            Tensor::from_slice(&obs.self_vec)
                .view([1, SELF_DIM as i64])
                .to_device(self.device),
        ));
        inputs.push(IValue::Tensor(
            Tensor::from_slice(&obs.ally_vec)
                .view([1, 5, ALLY_DIM as i64])
                .to_device(self.device),
        ));
        inputs.push(IValue::Tensor(
            Tensor::from_slice(&obs.enemy_vec)
                .view([1, 6, ENEMY_DIM as i64])
                .to_device(self.device),
        ));
        inputs.push(IValue::Tensor(
            Tensor::from_slice(&obs.global_vec)
                .view([1, GLOBAL_DIM as i64])
                .to_device(self.device),
        ));
        inputs.push(IValue::Tensor(
            Tensor::from_slice(&obs.grid)
                .view([1, GRID_CHANNELS as i64, GRID_H as i64, GRID_W as i64])
                .to_device(self.device),
        ));
        inputs.push(IValue::Tensor(hidden.h.shallow_clone()));
        inputs.push(IValue::Tensor(hidden.c.shallow_clone()));

        let mut mask_tensors = Vec::with_capacity(NUM_DISCRETE_HEADS);
        for head in 0..NUM_DISCRETE_HEADS {
            let row = masks.row(head, agent);
            let t = Tensor::from_slice(row)
                .view([1, row.len() as i64])
                .to_device(self.device);
            mask_tensors.push(t.shallow_clone());
            inputs.push(IValue::Tensor(t));
        }

        let output = tch::no_grad(|| model.forward_is(&inputs))?;
        let IValue::Tuple(elems) = output else {
            return Err(InferError::Output("forward did not return a tuple"));
        };
        // 11 logits + move (mean, logstd) + point (mean, logstd) + value + h + c
        if elems.len() != NUM_DISCRETE_HEADS + 7 {
            return Err(InferError::Output("unexpected tuple arity"));
        }

        let mut step = HeroStep::default_step();
        let mut total_log_prob = 0.0f32;

        for head in 0..NUM_DISCRETE_HEADS {
            let logits = expect_tensor(&elems[head])?;
            let (action, lp) = sample_categorical(logits, &mask_tensors[head]);
            step.discrete[head] = action;
            total_log_prob += lp;
        }

        let move_mean = expect_tensor(&elems[NUM_DISCRETE_HEADS])?;
        let move_logstd = expect_tensor(&elems[NUM_DISCRETE_HEADS + 1])?;
        let (move_xy, move_lp) = sample_normal(move_mean, move_logstd);
        step.move_xy = move_xy;
        total_log_prob += move_lp;

        let point_mean = expect_tensor(&elems[NUM_DISCRETE_HEADS + 2])?;
        let point_logstd = expect_tensor(&elems[NUM_DISCRETE_HEADS + 3])?;
        let (point_xy, point_lp) = sample_normal(point_mean, point_logstd);
        step.point_xy = point_xy;
        total_log_prob += point_lp;

        let value = expect_tensor(&elems[NUM_DISCRETE_HEADS + 4])?;
        step.value = value.reshape([-1]).double_value(&[0]) as f32;
        step.log_prob = total_log_prob;

        let new_hidden = HiddenState {
            h: expect_tensor(&elems[NUM_DISCRETE_HEADS + 5])?.shallow_clone(),
            c: expect_tensor(&elems[NUM_DISCRETE_HEADS + 6])?.shallow_clone(),
        };

        Ok((step, new_hidden))
    }
}

fn expect_tensor(v: &IValue) -> Result<&Tensor, InferError> {
    match v {
        IValue::Tensor(t) => Ok(t),
        _ => Err(InferError::Output("tuple element is not a tensor")),
    }
}

/// Masked categorical sample: -inf out disallowed entries, softmax, one
/// multinomial draw, log-prob via log-softmax gather.
fn sample_categorical(logits: &Tensor, mask: &Tensor) -> (i64, f32) {
    let masked = logits.masked_fill(&mask.logical_not(), -1e8);
    let probs = masked.softmax(-1, Kind::Float);
    let action = probs.multinomial(1, false); // (1, 1)
    let log_probs = masked.log_softmax(-1, Kind::Float);
    let lp = log_probs.gather(-1, &action, false);
    (action.int64_value(&[0, 0]), lp.double_value(&[0, 0]) as f32)
}

/// Gaussian sample with per-dimension log-density summed over dims.
/// `mean` is (1, 2); `logstd` is a free (2,) parameter vector.
fn sample_normal(mean: &Tensor, logstd: &Tensor) -> ([f32; 2], f32) {
    let std = logstd.exp();
    let noise = mean.randn_like();
    let sample = &noise * &std + mean;

    let diff = (&sample - mean) / &std;
    let log_prob = diff.square() * (-0.5) - logstd - 0.5 * LOG_2PI;
    let total = log_prob.sum(Kind::Float).double_value(&[]) as f32;

    let xy = [
        sample.double_value(&[0, 0]) as f32,
        sample.double_value(&[0, 1]) as f32,
    ];
    (xy, total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{GRID_CELLS, TEAM_SIZE};
    use crate::encoder::MaskSet;

    fn dummy_obs() -> AgentObs {
        AgentObs {
            self_vec: vec![0.0; SELF_DIM],
            ally_vec: vec![0.0; (TEAM_SIZE - 1) * ALLY_DIM],
            enemy_vec: vec![0.0; TEAM_SIZE * ENEMY_DIM],
            global_vec: vec![0.0; GLOBAL_DIM],
            grid: vec![0.0; GRID_CHANNELS * GRID_CELLS],
        }
    }

    #[test]
    fn missing_model_serves_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let engine = InferenceEngine::new(dir.path(), Device::Cpu);
        assert!(!engine.has_model());

        let hidden = engine.init_hidden();
        let masks = MaskSet::all_allowed();
        let (step, new_hidden) = engine
            .infer_hero(&dummy_obs(), &masks, 0, &hidden)
            .unwrap();

        assert_eq!(step, HeroStep::default_step());
        // Hidden pair passes through untouched.
        let (h, c) = new_hidden.to_vecs().unwrap();
        assert_eq!(h, vec![0.0; HIDDEN_DIM]);
        assert_eq!(c, vec![0.0; HIDDEN_DIM]);
    }

    #[test]
    fn init_hidden_shape_and_zeroing() {
        let dir = tempfile::tempdir().unwrap();
        let engine = InferenceEngine::new(dir.path(), Device::Cpu);
        let hidden = engine.init_hidden();
        assert_eq!(hidden.h.size(), &[1, 1, HIDDEN_DIM as i64]);
        assert_eq!(hidden.c.size(), &[1, 1, HIDDEN_DIM as i64]);
        let (h, _) = hidden.to_vecs().unwrap();
        assert!(h.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn reload_without_artifact_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = InferenceEngine::new(dir.path(), Device::Cpu);
        engine.maybe_reload();
        assert!(!engine.has_model());
    }

    #[test]
    fn categorical_sampling_respects_mask() {
        // Only index 2 is allowed; the sample must land there with lp ~ 0.
        let logits = Tensor::zeros([1, 5], (Kind::Float, Device::Cpu));
        let mask = Tensor::from_slice(&[false, false, true, false, false]).view([1, 5]);
        for _ in 0..8 {
            let (action, lp) = sample_categorical(&logits, &mask);
            assert_eq!(action, 2);
            assert!(lp.abs() < 1e-4);
        }
    }

    #[test]
    fn uniform_categorical_log_prob() {
        let logits = Tensor::zeros([1, 4], (Kind::Float, Device::Cpu));
        let mask = Tensor::from_slice(&[true; 4]).view([1, 4]);
        let (action, lp) = sample_categorical(&logits, &mask);
        assert!((0..4).contains(&action));
        assert!((lp - (0.25f32).ln()).abs() < 1e-4);
    }

    #[test]
    fn degenerate_normal_sampling() {
        // logstd -> -inf would be degenerate; with logstd = 0 the sample is
        // mean + unit noise and the log-prob is finite.
        let mean = Tensor::zeros([1, 2], (Kind::Float, Device::Cpu));
        let logstd = Tensor::zeros([2], (Kind::Float, Device::Cpu));
        let (xy, lp) = sample_normal(&mean, &logstd);
        assert!(xy[0].is_finite() && xy[1].is_finite());
        assert!(lp.is_finite());
        // Upper bound of the density: both samples exactly at the mean.
        assert!(lp <= (-0.5 * LOG_2PI as f32) * 2.0 + 1e-4);
    }

    #[test]
    fn resolve_device_cpu() {
        assert_eq!(resolve_device("cpu"), Device::Cpu);
    }

    #[test]
    fn default_step_is_all_zero() {
        let step = HeroStep::default_step();
        assert_eq!(step.discrete, [0; NUM_DISCRETE_HEADS]);
        assert_eq!(step.move_xy, [0.0; 2]);
        assert_eq!(step.point_xy, [0.0; 2]);
        assert_eq!(step.log_prob, 0.0);
        assert_eq!(step.value, 0.0);
    }
}
