// ============================================================
// Layer 5 — Sequence Model (Burn)
// ============================================================
// A small GPT-2 style causal decoder:
//
//   token embedding + position embedding
//     └── N × DecoderBlock (pre-norm)
//           ├── ln_1 → attn.c_attn (q,k,v) → causal attention → attn.c_proj
//           └── ln_2 → mlp.c_fc → GELU → mlp.c_proj
//   final LayerNorm → lm_head (no bias)
//
// Every projection is an addressable "sublayer" with a qualified
// name such as "h.0.attn.c_attn". An adapter overlay can be passed
// to forward(); the base weights themselves are never modified.
//
// Weights are drawn from a seeded RNG, so the same config always
// builds the same model.
//
// Reference: Radford et al. (2019) GPT-2
//            Vaswani et al. (2017) Attention Is All You Need

use burn::{
    module::Param,
    nn::{
        loss::CrossEntropyLossConfig, Embedding, EmbeddingConfig, LayerNorm, LayerNormConfig,
        Linear, LinearConfig,
    },
    prelude::*,
    tensor::activation::{gelu, softmax},
};
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::ml::adapter::{BlockAdapter, LoraAdapter, SublayerAdapter};

const EMBED_INIT_BOUND: f32 = 0.035;
const MASKED_SCORE: f32 = -1.0e9;

// NOTE: #[derive(Config)] already generates Clone and Serialize/Deserialize.
#[derive(Config, Debug)]
pub struct SequenceModelConfig {
    pub vocab_size:  usize,
    pub max_seq_len: usize,
    pub d_model:     usize,
    pub num_heads:   usize,
    pub num_layers:  usize,
    pub d_ff:        usize,
    #[config(default = 0)]
    pub seed:        u64,
}

/// The four projection kinds inside every decoder block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SublayerKind {
    AttnQkv,
    AttnProj,
    MlpFc,
    MlpProj,
}

impl SublayerKind {
    pub const ALL: [SublayerKind; 4] = [
        SublayerKind::AttnQkv,
        SublayerKind::AttnProj,
        SublayerKind::MlpFc,
        SublayerKind::MlpProj,
    ];

    pub fn index(self) -> usize {
        match self {
            SublayerKind::AttnQkv  => 0,
            SublayerKind::AttnProj => 1,
            SublayerKind::MlpFc    => 2,
            SublayerKind::MlpProj  => 3,
        }
    }

    /// Name of the sublayer inside its block.
    pub fn local_name(self) -> &'static str {
        match self {
            SublayerKind::AttnQkv  => "attn.c_attn",
            SublayerKind::AttnProj => "attn.c_proj",
            SublayerKind::MlpFc    => "mlp.c_fc",
            SublayerKind::MlpProj  => "mlp.c_proj",
        }
    }
}

/// A projection sublayer and its input/output widths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SublayerInfo {
    pub name:  String,
    pub layer: usize,
    pub kind:  SublayerKind,
    pub d_in:  usize,
    pub d_out: usize,
}

impl SequenceModelConfig {
    /// Every adaptable sublayer, block by block.
    pub fn sublayers(&self) -> Vec<SublayerInfo> {
        (0..self.num_layers)
            .flat_map(|layer| {
                SublayerKind::ALL.into_iter().map(move |kind| {
                    let (d_in, d_out) = self.sublayer_dims(kind);
                    SublayerInfo {
                        name: format!("h.{layer}.{}", kind.local_name()),
                        layer,
                        kind,
                        d_in,
                        d_out,
                    }
                })
            })
            .collect()
    }

    pub fn sublayer_dims(&self, kind: SublayerKind) -> (usize, usize) {
        match kind {
            SublayerKind::AttnQkv  => (self.d_model, 3 * self.d_model),
            SublayerKind::AttnProj => (self.d_model, self.d_model),
            SublayerKind::MlpFc    => (self.d_model, self.d_ff),
            SublayerKind::MlpProj  => (self.d_ff, self.d_model),
        }
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> SequenceModel<B> {
        let mut rng = StdRng::seed_from_u64(self.seed);

        let wte = seeded_embedding(&mut rng, self.vocab_size, self.d_model, device);
        let wpe = seeded_embedding(&mut rng, self.max_seq_len, self.d_model, device);
        let blocks = (0..self.num_layers)
            .map(|_| self.build_block(&mut rng, device))
            .collect();
        let ln_f    = LayerNormConfig::new(self.d_model).init(device);
        let lm_head = seeded_linear(&mut rng, self.d_model, self.vocab_size, false, device);

        SequenceModel {
            wte,
            wpe,
            blocks,
            ln_f,
            lm_head,
            max_seq_len: self.max_seq_len,
        }
    }

    fn build_block<B: Backend>(&self, rng: &mut StdRng, device: &B::Device) -> DecoderBlock<B> {
        let d = self.d_model;
        DecoderBlock {
            ln_1:      LayerNormConfig::new(d).init(device),
            c_attn:    seeded_linear(rng, d, 3 * d, true, device),
            attn_proj: seeded_linear(rng, d, d, true, device),
            ln_2:      LayerNormConfig::new(d).init(device),
            c_fc:      seeded_linear(rng, d, self.d_ff, true, device),
            mlp_proj:  seeded_linear(rng, self.d_ff, d, true, device),
            num_heads: self.num_heads,
        }
    }
}

/// A tensor filled from U(-bound, bound) with the given RNG.
pub(crate) fn seeded_uniform<B: Backend, const D: usize>(
    rng:    &mut StdRng,
    shape:  [usize; D],
    bound:  f32,
    device: &B::Device,
) -> Tensor<B, D> {
    let n: usize = shape.iter().product();
    let values: Vec<f32> = (0..n).map(|_| rng.gen_range(-bound..=bound)).collect();
    Tensor::<B, 1>::from_floats(values.as_slice(), device).reshape(shape)
}

fn seeded_linear<B: Backend>(
    rng:    &mut StdRng,
    d_in:   usize,
    d_out:  usize,
    bias:   bool,
    device: &B::Device,
) -> Linear<B> {
    let bound = 1.0 / (d_in as f32).sqrt();
    let mut linear = LinearConfig::new(d_in, d_out).with_bias(bias).init(device);
    linear.weight = Param::from_tensor(seeded_uniform(rng, [d_in, d_out], bound, device));
    if bias {
        linear.bias = Some(Param::from_tensor(Tensor::zeros([d_out], device)));
    }
    linear
}

fn seeded_embedding<B: Backend>(
    rng:    &mut StdRng,
    n:      usize,
    d:      usize,
    device: &B::Device,
) -> Embedding<B> {
    let mut embedding = EmbeddingConfig::new(n, d).init(device);
    embedding.weight = Param::from_tensor(seeded_uniform(rng, [n, d], EMBED_INIT_BOUND, device));
    embedding
}

/// Apply a projection and, when present, its adapter overlay.
fn project<B: Backend>(
    linear:  &Linear<B>,
    x:       Tensor<B, 3>,
    overlay: Option<&SublayerAdapter<B>>,
) -> Tensor<B, 3> {
    match overlay {
        Some(adapter) => {
            let base = linear.forward(x.clone());
            adapter.apply(x, base)
        }
        None => linear.forward(x),
    }
}

#[derive(Module, Debug)]
pub struct DecoderBlock<B: Backend> {
    pub ln_1:      LayerNorm<B>,
    pub c_attn:    Linear<B>,
    pub attn_proj: Linear<B>,
    pub ln_2:      LayerNorm<B>,
    pub c_fc:      Linear<B>,
    pub mlp_proj:  Linear<B>,
    pub num_heads: usize,
}

impl<B: Backend> DecoderBlock<B> {
    pub fn forward(
        &self,
        x:         Tensor<B, 3>,
        attn_bias: Tensor<B, 4>,
        overlay:   Option<&BlockAdapter<B>>,
    ) -> Tensor<B, 3> {
        let slot = |kind: SublayerKind| overlay.and_then(|a| a.get(kind));

        let h = self.attention(self.ln_1.forward(x.clone()), attn_bias, overlay);
        let x = x + h;

        let h = project(&self.c_fc, self.ln_2.forward(x.clone()), slot(SublayerKind::MlpFc));
        let h = project(&self.mlp_proj, gelu(h), slot(SublayerKind::MlpProj));
        x + h
    }

    fn attention(
        &self,
        x:         Tensor<B, 3>,
        attn_bias: Tensor<B, 4>,
        overlay:   Option<&BlockAdapter<B>>,
    ) -> Tensor<B, 3> {
        let slot = |kind: SublayerKind| overlay.and_then(|a| a.get(kind));
        let [batch, seq, d] = x.dims();
        let heads    = self.num_heads;
        let head_dim = d / heads;

        let qkv = project(&self.c_attn, x, slot(SublayerKind::AttnQkv)); // [b, s, 3d]
        let split = |t: Tensor<B, 3>| t.reshape([batch, seq, heads, head_dim]).swap_dims(1, 2);
        let q = split(qkv.clone().slice([0..batch, 0..seq, 0..d]));
        let k = split(qkv.clone().slice([0..batch, 0..seq, d..2 * d]));
        let v = split(qkv.slice([0..batch, 0..seq, 2 * d..3 * d]));

        let scores = q
            .matmul(k.swap_dims(2, 3))
            .div_scalar((head_dim as f64).sqrt())
            + attn_bias; // [b, h, s, s]
        let weights = softmax(scores, 3);

        let context = weights
            .matmul(v)
            .swap_dims(1, 2)
            .reshape([batch, seq, d]);
        project(&self.attn_proj, context, slot(SublayerKind::AttnProj))
    }
}

#[derive(Module, Debug)]
pub struct SequenceModel<B: Backend> {
    pub wte:         Embedding<B>,
    pub wpe:         Embedding<B>,
    pub blocks:      Vec<DecoderBlock<B>>,
    pub ln_f:        LayerNorm<B>,
    pub lm_head:     Linear<B>,
    pub max_seq_len: usize,
}

impl<B: Backend> SequenceModel<B> {
    /// input_ids: [batch, seq_len] → logits: [batch, seq_len, vocab]
    ///
    /// `mask_rows` holds one 0/1 attention-mask row per sequence.
    pub fn forward(
        &self,
        input_ids: Tensor<B, 2, Int>,
        mask_rows: &[Vec<u32>],
        overlay:   Option<&LoraAdapter<B>>,
    ) -> Tensor<B, 3> {
        let [batch, seq] = input_ids.dims();
        let device = input_ids.device();

        let tok_emb = self.wte.forward(input_ids);
        let positions = Tensor::<B, 1, Int>::arange(0..seq as i64, &device)
            .unsqueeze::<2>()
            .expand([batch, seq]);
        let pos_emb = self.wpe.forward(positions);

        let attn_bias = attention_bias::<B>(mask_rows, batch, seq, &device);

        let mut x = tok_emb + pos_emb;
        for (i, block) in self.blocks.iter().enumerate() {
            x = block.forward(x, attn_bias.clone(), overlay.and_then(|a| a.block(i)));
        }
        self.lm_head.forward(self.ln_f.forward(x))
    }

    pub fn device(&self) -> B::Device {
        self.lm_head.weight.val().device()
    }
}

/// A frozen-or-not base model together with its name and shape.
#[derive(Debug, Clone)]
pub struct BaseModel<B: Backend> {
    pub name:   String,
    pub config: SequenceModelConfig,
    pub model:  SequenceModel<B>,
}

impl<B: Backend> BaseModel<B> {
    pub fn new(name: impl Into<String>, config: SequenceModelConfig, model: SequenceModel<B>) -> Self {
        Self { name: name.into(), config, model }
    }

    pub fn num_params(&self) -> usize {
        self.model.num_params()
    }
}

/// Additive attention bias of shape [batch, 1, seq, seq].
///
/// Query i may attend key j when j <= i and j is a real token. The
/// diagonal is always open so fully padded rows stay finite.
fn attention_bias<B: Backend>(
    mask_rows: &[Vec<u32>],
    batch:     usize,
    seq:       usize,
    device:    &B::Device,
) -> Tensor<B, 4> {
    let mut values = vec![MASKED_SCORE; batch * seq * seq];
    for b in 0..batch {
        let row = mask_rows.get(b);
        for i in 0..seq {
            for j in 0..=i {
                let real = row.and_then(|r| r.get(j)).map_or(true, |&m| m != 0);
                if real || i == j {
                    values[(b * seq + i) * seq + j] = 0.0;
                }
            }
        }
    }
    Tensor::<B, 1>::from_floats(values.as_slice(), device).reshape([batch, 1, seq, seq])
}

/// Next-token cross-entropy. Position t predicts token t+1; targets
/// equal to `pad_id` are ignored.
pub fn lm_loss<B: Backend>(
    logits:    Tensor<B, 3>,
    input_ids: Tensor<B, 2, Int>,
    pad_id:    u32,
) -> Tensor<B, 1> {
    let [batch, seq, vocab] = logits.dims();
    let predicted = logits
        .slice([0..batch, 0..seq - 1, 0..vocab])
        .reshape([batch * (seq - 1), vocab]);
    let targets = input_ids
        .slice([0..batch, 1..seq])
        .reshape([batch * (seq - 1)]);

    let ce = CrossEntropyLossConfig::new()
        .with_pad_tokens(Some(vec![pad_id as usize]))
        .init(&predicted.device());
    ce.forward(predicted, targets)
}
