// ============================================================
// Layer 5 — Low-Rank Adapter Injection
// ============================================================
// The adapter is a separate Burn module that lives NEXT TO the
// base model rather than inside it:
//
//   LoraAdapter
//     └── blocks[i]: BlockAdapter
//           └── sublayers[kind]: Option<SublayerAdapter>
//                 ├── low_rank: Option<LowRank>   (A, B, dropout, scaling)
//                 └── bias:     Option<Param>     (Δb)
//
// SequenceModel::forward takes the adapter as an overlay and adds
// each delta on top of the frozen projection output. Because only
// the adapter is handed to the optimizer, gradients can never reach
// a base weight, and saving the adapter record saves exactly the
// trainable parameters.
//
// B starts at zero, so a freshly injected model computes the same
// function as its base model.

use burn::{
    module::Param,
    nn::{Dropout, DropoutConfig},
    prelude::*,
};
use rand::{rngs::StdRng, SeedableRng};

use crate::domain::adapter_spec::{AdapterSpec, BiasMode};
use crate::error::{FineTuneError, Result};
use crate::infra::checkpoint::AdapterWeights;
use crate::ml::model::{seeded_uniform, BaseModel, SublayerInfo, SublayerKind};

// ─── Adapter Modules ─────────────────────────────────────────────────────────

/// Rank-r update A·B for one projection.
#[derive(Module, Debug)]
pub struct LowRank<B: Backend> {
    /// [d_in, rank], seeded uniform
    pub lora_a:  Param<Tensor<B, 2>>,
    /// [rank, d_out], zeros
    pub lora_b:  Param<Tensor<B, 2>>,
    pub dropout: Dropout,
    pub scaling: f64,
}

#[derive(Module, Debug)]
pub struct SublayerAdapter<B: Backend> {
    pub low_rank: Option<LowRank<B>>,
    pub bias:     Option<Param<Tensor<B, 1>>>,
}

impl<B: Backend> SublayerAdapter<B> {
    /// Add this adapter's deltas to a base projection output.
    ///
    /// x: [batch, seq, d_in], base: [batch, seq, d_out]
    pub fn apply(&self, x: Tensor<B, 3>, base: Tensor<B, 3>) -> Tensor<B, 3> {
        let mut out = base;
        if let Some(lr) = &self.low_rank {
            let delta = lr
                .dropout
                .forward(x)
                .matmul(lr.lora_a.val().unsqueeze())
                .matmul(lr.lora_b.val().unsqueeze());
            out = out + delta.mul_scalar(lr.scaling);
        }
        if let Some(bias) = &self.bias {
            out = out + bias.val().unsqueeze::<3>();
        }
        out
    }
}

#[derive(Module, Debug)]
pub struct BlockAdapter<B: Backend> {
    /// Indexed by SublayerKind::index()
    pub sublayers: Vec<Option<SublayerAdapter<B>>>,
}

impl<B: Backend> BlockAdapter<B> {
    pub fn get(&self, kind: SublayerKind) -> Option<&SublayerAdapter<B>> {
        self.sublayers.get(kind.index()).and_then(Option::as_ref)
    }
}

#[derive(Module, Debug)]
pub struct LoraAdapter<B: Backend> {
    pub blocks: Vec<BlockAdapter<B>>,
}

impl<B: Backend> LoraAdapter<B> {
    pub fn block(&self, layer: usize) -> Option<&BlockAdapter<B>> {
        self.blocks.get(layer)
    }
}

// ─── Model Handles ───────────────────────────────────────────────────────────

/// A base model with a trainable adapter attached.
#[derive(Debug, Clone)]
pub struct AdaptedModel<B: Backend> {
    base:    BaseModel<B>,
    adapter: LoraAdapter<B>,
    spec:    AdapterSpec,
    adapted: Vec<String>,
}

/// Either an untouched base model or one that already carries an adapter.
#[derive(Debug, Clone)]
pub enum ModelHandle<B: Backend> {
    Base(BaseModel<B>),
    Adapted(AdaptedModel<B>),
}

impl<B: Backend> From<BaseModel<B>> for ModelHandle<B> {
    fn from(base: BaseModel<B>) -> Self {
        ModelHandle::Base(base)
    }
}

impl<B: Backend> From<AdaptedModel<B>> for ModelHandle<B> {
    fn from(model: AdaptedModel<B>) -> Self {
        ModelHandle::Adapted(model)
    }
}

impl<B: Backend> AdaptedModel<B> {
    /// logits: [batch, seq, vocab]
    pub fn forward(&self, input_ids: Tensor<B, 2, Int>, mask_rows: &[Vec<u32>]) -> Tensor<B, 3> {
        self.base.model.forward(input_ids, mask_rows, Some(&self.adapter))
    }

    pub fn base(&self) -> &BaseModel<B> {
        &self.base
    }

    pub fn base_model_name(&self) -> &str {
        &self.base.name
    }

    pub fn adapter(&self) -> &LoraAdapter<B> {
        &self.adapter
    }

    pub fn spec(&self) -> &AdapterSpec {
        &self.spec
    }

    /// Qualified names of the sublayers that received a low-rank update.
    pub fn adapted_sublayers(&self) -> &[String] {
        &self.adapted
    }

    pub fn trainable_params(&self) -> usize {
        self.adapter.num_params()
    }

    /// Base parameters plus adapter parameters.
    pub fn total_params(&self) -> usize {
        self.base.num_params() + self.adapter.num_params()
    }

    pub fn device(&self) -> B::Device {
        self.base.model.device()
    }

    /// Swap in an updated adapter, e.g. after an optimizer step.
    pub fn set_adapter(&mut self, adapter: LoraAdapter<B>) {
        self.adapter = adapter;
    }
}

// ─── Injection ───────────────────────────────────────────────────────────────

/// Attach a fresh adapter described by `spec` to a base model.
///
/// Errors:
///   AlreadyAdapted — the handle already carries an adapter
///   InvalidConfig  — spec values are out of range, or rank exceeds a
///                    targeted sublayer's width
///   InvalidTarget  — a target name matches no sublayer
pub fn inject<B: Backend>(model: impl Into<ModelHandle<B>>, spec: &AdapterSpec) -> Result<AdaptedModel<B>> {
    let base = match model.into() {
        ModelHandle::Base(base) => base,
        ModelHandle::Adapted(adapted) => {
            return Err(FineTuneError::AlreadyAdapted { model: adapted.base.name });
        }
    };
    spec.validate()?;

    let sublayers = base.config.sublayers();
    for target in &spec.target_modules {
        if !sublayers.iter().any(|s| AdapterSpec::target_matches(target, &s.name)) {
            return Err(FineTuneError::InvalidTarget {
                target: target.clone(),
                model:  base.name.clone(),
            });
        }
    }

    let device = base.model.device();
    let mut rng = StdRng::seed_from_u64(spec.init_seed);
    let mut adapted = Vec::new();
    let mut blocks: Vec<BlockAdapter<B>> = (0..base.config.num_layers)
        .map(|_| BlockAdapter { sublayers: SublayerKind::ALL.iter().map(|_| None).collect() })
        .collect();

    for info in &sublayers {
        let targeted = spec
            .target_modules
            .iter()
            .any(|t| AdapterSpec::target_matches(t, &info.name));

        let low_rank = if targeted {
            adapted.push(info.name.clone());
            Some(init_low_rank(info, spec, &mut rng, &device)?)
        } else {
            None
        };

        let trains_bias = match spec.bias {
            BiasMode::All      => true,
            BiasMode::LoraOnly => targeted,
            BiasMode::None     => false,
        };
        let bias = trains_bias.then(|| Param::from_tensor(Tensor::zeros([info.d_out], &device)));

        if low_rank.is_some() || bias.is_some() {
            blocks[info.layer].sublayers[info.kind.index()] = Some(SublayerAdapter { low_rank, bias });
        }
    }

    let frozen = BaseModel {
        model: base.model.no_grad(),
        ..base
    };
    let adapter = LoraAdapter { blocks };

    tracing::info!(
        "Injected rank-{} adapter into {} sublayers of '{}' ({} trainable / {} base params)",
        spec.rank,
        adapted.len(),
        frozen.name,
        adapter.num_params(),
        frozen.num_params()
    );

    Ok(AdaptedModel {
        base: frozen,
        adapter,
        spec: spec.clone(),
        adapted,
    })
}

fn init_low_rank<B: Backend>(
    info:   &SublayerInfo,
    spec:   &AdapterSpec,
    rng:    &mut StdRng,
    device: &B::Device,
) -> Result<LowRank<B>> {
    if spec.rank > info.d_in.min(info.d_out) {
        return Err(FineTuneError::InvalidConfig(format!(
            "adapter rank {} exceeds the width of sublayer '{}' ({}x{})",
            spec.rank, info.name, info.d_in, info.d_out
        )));
    }

    // Kaiming-uniform bound for A; B at zero keeps the initial delta at zero
    let bound = 1.0 / (info.d_in as f32).sqrt();
    Ok(LowRank {
        lora_a:  Param::from_tensor(seeded_uniform(rng, [info.d_in, spec.rank], bound, device)),
        lora_b:  Param::from_tensor(Tensor::zeros([spec.rank, info.d_out], device)),
        dropout: DropoutConfig::new(spec.dropout).init(),
        scaling: spec.scaling(),
    })
}

/// Rebuild an adapted model from saved adapter weights.
pub fn reattach<B: Backend>(base: BaseModel<B>, weights: AdapterWeights<B>) -> Result<AdaptedModel<B>> {
    if weights.checkpoint.base_model != base.name {
        return Err(FineTuneError::InvalidConfig(format!(
            "checkpoint '{}' was trained on '{}', not '{}'",
            weights.checkpoint.path.display(),
            weights.checkpoint.base_model,
            base.name
        )));
    }
    let mut model = inject(base, &weights.checkpoint.spec)?;
    model.adapter = model.adapter.load_record(weights.record);
    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::model::SequenceModelConfig;
    use burn::backend::{Autodiff, NdArray};

    type TestBackend = NdArray;

    fn tiny_base() -> BaseModel<TestBackend> {
        let config = SequenceModelConfig::new(40, 16, 16, 2, 2, 32).with_seed(5);
        let model = config.init(&Default::default());
        BaseModel::new("tiny-test", config, model)
    }

    fn spec(targets: &[&str]) -> AdapterSpec {
        AdapterSpec {
            rank:           4,
            alpha:          8.0,
            target_modules: targets.iter().map(|t| t.to_string()).collect(),
            dropout:        0.0,
            ..AdapterSpec::default()
        }
    }

    fn sample_ids() -> Tensor<TestBackend, 2, Int> {
        Tensor::<TestBackend, 1, Int>::from_ints([3, 9, 12, 7].as_slice(), &Default::default())
            .reshape([1, 4])
    }

    #[test]
    fn test_trainable_params_are_a_strict_minority() {
        let adapted = inject(tiny_base(), &spec(&["c_attn", "c_proj"])).unwrap();
        assert!(adapted.trainable_params() > 0);
        assert!(adapted.trainable_params() < adapted.total_params());
        assert!(adapted.trainable_params() < adapted.base().num_params());
    }

    #[test]
    fn test_suffix_target_covers_attention_and_mlp_projections() {
        let adapted = inject(tiny_base(), &spec(&["c_proj"])).unwrap();
        assert_eq!(
            adapted.adapted_sublayers(),
            &["h.0.attn.c_proj", "h.0.mlp.c_proj", "h.1.attn.c_proj", "h.1.mlp.c_proj"]
        );
    }

    #[test]
    fn test_unknown_target_is_rejected_by_name() {
        let err = inject(tiny_base(), &spec(&["q_proj"])).unwrap_err();
        match err {
            FineTuneError::InvalidTarget { target, model } => {
                assert_eq!(target, "q_proj");
                assert_eq!(model, "tiny-test");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_second_injection_is_rejected() {
        let adapted = inject(tiny_base(), &spec(&["c_attn"])).unwrap();
        let err = inject(adapted, &spec(&["c_attn"])).unwrap_err();
        assert!(matches!(err, FineTuneError::AlreadyAdapted { .. }));
    }

    #[test]
    fn test_rank_wider_than_sublayer_is_rejected() {
        let wide = AdapterSpec { rank: 17, ..spec(&["attn.c_proj"]) };
        assert!(matches!(inject(tiny_base(), &wide), Err(FineTuneError::InvalidConfig(_))));
    }

    #[test]
    fn test_fresh_adapter_leaves_outputs_unchanged() {
        let base = tiny_base();
        let mask = vec![vec![1, 1, 1, 1]];
        let before = base
            .model
            .forward(sample_ids(), &mask, None)
            .into_data()
            .to_vec::<f32>()
            .unwrap();

        let adapted = inject(base, &spec(&["c_attn", "c_fc"])).unwrap();
        let after = adapted.forward(sample_ids(), &mask).into_data().to_vec::<f32>().unwrap();

        for (a, b) in before.iter().zip(&after) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn test_bias_modes_control_bias_deltas() {
        let lora_only = inject(tiny_base(), &AdapterSpec { bias: BiasMode::LoraOnly, ..spec(&["c_attn"]) }).unwrap();
        let all = inject(tiny_base(), &AdapterSpec { bias: BiasMode::All, ..spec(&["c_attn"]) }).unwrap();
        let none = inject(tiny_base(), &spec(&["c_attn"])).unwrap();

        assert!(none.trainable_params() < lora_only.trainable_params());
        assert!(lora_only.trainable_params() < all.trainable_params());

        let block = all.adapter().block(0).unwrap();
        assert!(block.get(SublayerKind::MlpFc).is_some_and(|s| s.low_rank.is_none() && s.bias.is_some()));
    }

    #[test]
    fn test_gradients_reach_adapter_only() {
        type AdBackend = Autodiff<NdArray>;
        let config = SequenceModelConfig::new(40, 16, 16, 2, 1, 32).with_seed(5);
        let base = BaseModel::new("tiny-test", config.clone(), config.init::<AdBackend>(&Default::default()));
        let adapted = inject(base, &spec(&["c_attn"])).unwrap();

        let ids = Tensor::<AdBackend, 1, Int>::from_ints([3, 9, 12, 7].as_slice(), &Default::default())
            .reshape([1, 4]);
        let logits = adapted.forward(ids, &[vec![1, 1, 1, 1]]);
        let grads = logits.sum().backward();

        let lr = adapted.adapter().block(0).unwrap().get(SublayerKind::AttnQkv).unwrap().low_rank.as_ref().unwrap();
        assert!(lr.lora_b.val().grad(&grads).is_some());
        assert!(adapted.base().model.lm_head.weight.val().grad(&grads).is_none());
    }
}
