//! Request-Line Scoring Model
//!
//! A character-level CNN: embedding, a strided 1-D convolution, spatial
//! pyramid max pooling, and a linear head producing a two-class
//! log-probability distribution. The pyramid pooling stage makes the
//! representation width independent of the request-line length, so one
//! set of linear weights scores lines of any size.
//!
//! Forward passes are pure functions of the parameters and the input;
//! `forward` and `forward_from_embedding` are numerically consistent, so
//! the adversarial generator can backpropagate into embedding space and
//! still agree with the deployed scoring path.

pub mod spp;
pub mod train;

use ndarray::{Array1, Array2, Array3, Axis};
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::codec::{self, TokenId, VOCAB_SIZE};
use crate::corpus::{Batch, Label};

/// Network hyperparameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Vocabulary size (alphabet plus pad sentinel).
    pub vocab_size: usize,
    /// Embedding width per token.
    pub embed_dim: usize,
    /// Convolution output channels.
    pub conv_channels: usize,
    /// Convolution kernel width, in tokens.
    pub kernel_size: usize,
    /// Convolution stride, in tokens.
    pub stride: usize,
    /// Pyramid pooling level count.
    pub spp_levels: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            vocab_size: VOCAB_SIZE,
            embed_dim: 32,
            conv_channels: 16,
            kernel_size: 64,
            stride: 32,
            spp_levels: 3,
        }
    }
}

impl ModelConfig {
    /// Width of the pooled representation.
    pub fn feature_dim(&self) -> usize {
        self.conv_channels * spp::grid_count(self.spp_levels)
    }
}

/// All trainable tensors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Parameters {
    /// (vocab, embed_dim)
    pub embedding: Array2<f32>,
    /// (channels, embed_dim, kernel)
    pub conv_w: Array3<f32>,
    /// (channels,)
    pub conv_b: Array1<f32>,
    /// (2, feature_dim)
    pub linear_w: Array2<f32>,
    /// (2,)
    pub linear_b: Array1<f32>,
}

/// The scoring model: hyperparameters plus parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringModel {
    config: ModelConfig,
    params: Parameters,
}

/// Intermediate activations kept for the backward pass.
#[derive(Debug)]
pub(crate) struct ForwardPass {
    /// Pre-activation convolution output, (batch, channels, conv_width).
    conv_pre: Array3<f32>,
    /// tanh(conv_pre).
    activated: Array3<f32>,
    /// Pooled representation, (batch, feature_dim).
    pooled: Array2<f32>,
    /// Argmax positions of every pooled span.
    pool_src: Array2<usize>,
    /// Log-probabilities, (batch, 2).
    pub log_probs: Array2<f32>,
}

/// Gradients produced by one backward pass, stopping at the embedded input.
#[derive(Debug)]
pub(crate) struct BackwardPass {
    pub loss: f32,
    /// Gradient w.r.t. the embedded input, (batch, width, embed_dim).
    pub input_grad: Array3<f32>,
    pub conv_w_grad: Array3<f32>,
    pub conv_b_grad: Array1<f32>,
    pub linear_w_grad: Array2<f32>,
    pub linear_b_grad: Array1<f32>,
}

impl ScoringModel {
    /// Create a model with randomly initialized parameters.
    pub fn new<R: Rng>(config: ModelConfig, rng: &mut R) -> Self {
        let embedding = Array2::from_shape_fn((config.vocab_size, config.embed_dim), |_| {
            rng.sample::<f32, _>(StandardNormal)
        });

        let conv_fan_in = (config.embed_dim * config.kernel_size) as f32;
        let conv_bound = conv_fan_in.sqrt().recip();
        let conv_w = Array3::from_shape_fn(
            (config.conv_channels, config.embed_dim, config.kernel_size),
            |_| rng.gen_range(-conv_bound..conv_bound),
        );
        let conv_b =
            Array1::from_shape_fn(config.conv_channels, |_| rng.gen_range(-conv_bound..conv_bound));

        let linear_bound = (config.feature_dim() as f32).sqrt().recip();
        let linear_w = Array2::from_shape_fn((2, config.feature_dim()), |_| {
            rng.gen_range(-linear_bound..linear_bound)
        });
        let linear_b = Array1::from_shape_fn(2, |_| rng.gen_range(-linear_bound..linear_bound));

        Self {
            config,
            params: Parameters {
                embedding,
                conv_w,
                conv_b,
                linear_w,
                linear_b,
            },
        }
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub(crate) fn params(&self) -> &Parameters {
        &self.params
    }

    pub(crate) fn params_mut(&mut self) -> &mut Parameters {
        &mut self.params
    }

    /// Embed a batch of token sequences into (batch, width, embed_dim).
    pub fn embed(&self, batch: &Batch) -> Array3<f32> {
        let (rows, width) = batch.tokens.dim();
        let mut out = Array3::<f32>::zeros((rows, width, self.config.embed_dim));
        for b in 0..rows {
            for t in 0..width {
                let token = batch.tokens[[b, t]];
                out.slice_mut(ndarray::s![b, t, ..])
                    .assign(&self.params.embedding.row(token));
            }
        }
        out
    }

    /// Embed a single token sequence as a one-row batch.
    pub fn embed_line(&self, tokens: &[TokenId]) -> Array3<f32> {
        let mut out = Array3::<f32>::zeros((1, tokens.len(), self.config.embed_dim));
        for (t, &token) in tokens.iter().enumerate() {
            out.slice_mut(ndarray::s![0, t, ..])
                .assign(&self.params.embedding.row(token));
        }
        out
    }

    /// Score a batch, returning per-row log-probabilities over (benign,
    /// malicious).
    pub fn forward(&self, batch: &Batch) -> Array2<f32> {
        self.forward_from_embedding(&self.embed(batch))
    }

    /// Score an already-embedded batch. Equal to `forward` composed with
    /// `embed`.
    pub fn forward_from_embedding(&self, embedded: &Array3<f32>) -> Array2<f32> {
        self.run_forward(embedded).log_probs
    }

    /// Loss and gradient of the mean NLL loss (toward `targets`) with
    /// respect to the embedded input. Entry point for the adversarial
    /// generator.
    pub fn input_gradient(
        &self,
        embedded: &Array3<f32>,
        targets: &[Label],
    ) -> (Array2<f32>, f32, Array3<f32>) {
        let pass = self.run_forward(embedded);
        let back = self.backward_from(embedded, &pass, targets);
        (pass.log_probs, back.loss, back.input_grad)
    }

    /// Embedding rows for ASCII letters and digits, the legal projection
    /// set for adversarial perturbations. Recomputed from the current
    /// parameters on every call.
    pub fn alnum_embeddings(&self) -> Vec<(TokenId, Array1<f32>)> {
        codec::alphanumeric_tokens()
            .into_iter()
            .map(|t| (t, self.params.embedding.row(t).to_owned()))
            .collect()
    }

    /// Nearest vocabulary token to an embedding vector, by Euclidean
    /// distance over the printable alphabet (the pad sentinel is excluded).
    pub fn nearest_token(&self, vector: &Array1<f32>) -> TokenId {
        let mut best = 0;
        let mut best_dist = f32::INFINITY;
        for token in 0..codec::PAD_TOKEN {
            let row = self.params.embedding.row(token);
            let dist = vector
                .iter()
                .zip(row.iter())
                .map(|(a, b)| (a - b) * (a - b))
                .sum::<f32>();
            if dist < best_dist {
                best_dist = dist;
                best = token;
            }
        }
        best
    }

    pub(crate) fn run_forward(&self, embedded: &Array3<f32>) -> ForwardPass {
        let (batch, width, embed_dim) = embedded.dim();
        debug_assert_eq!(embed_dim, self.config.embed_dim);
        debug_assert!(width >= self.config.kernel_size, "input narrower than kernel");

        let channels = self.config.conv_channels;
        let kernel = self.config.kernel_size;
        let stride = self.config.stride;
        let conv_width = (width - kernel) / stride + 1;

        let mut conv_pre = Array3::<f32>::zeros((batch, channels, conv_width));
        for b in 0..batch {
            for o in 0..channels {
                for j in 0..conv_width {
                    let mut acc = self.params.conv_b[o];
                    for k in 0..kernel {
                        let t = j * stride + k;
                        for i in 0..embed_dim {
                            acc += self.params.conv_w[[o, i, k]] * embedded[[b, t, i]];
                        }
                    }
                    conv_pre[[b, o, j]] = acc;
                }
            }
        }

        let activated = conv_pre.mapv(f32::tanh);
        let pooled = spp::forward(&activated, self.config.spp_levels);

        let logits = pooled.values.dot(&self.params.linear_w.t()) + &self.params.linear_b;
        let log_probs = log_softmax(&logits);

        ForwardPass {
            conv_pre,
            activated,
            pooled: pooled.values,
            pool_src: pooled.source,
            log_probs,
        }
    }

    pub(crate) fn backward_from(
        &self,
        embedded: &Array3<f32>,
        pass: &ForwardPass,
        targets: &[Label],
    ) -> BackwardPass {
        let (batch, width, embed_dim) = embedded.dim();
        let channels = self.config.conv_channels;
        let kernel = self.config.kernel_size;
        let stride = self.config.stride;
        let conv_width = pass.conv_pre.dim().2;

        let loss = nll_loss(&pass.log_probs, targets);

        // d(mean NLL)/d(logits) = (softmax - onehot) / batch
        let mut logits_grad = pass.log_probs.mapv(f32::exp);
        for (b, label) in targets.iter().enumerate() {
            logits_grad[[b, label.index()]] -= 1.0;
        }
        logits_grad /= batch as f32;

        let linear_w_grad = logits_grad.t().dot(&pass.pooled);
        let linear_b_grad = logits_grad.sum_axis(Axis(0));
        let pooled_grad = logits_grad.dot(&self.params.linear_w);

        let activated_grad = spp::backward(
            &pooled_grad,
            &pass.pool_src,
            channels,
            conv_width,
            self.config.spp_levels,
        );

        // tanh'(z) = 1 - tanh(z)^2
        let mut conv_pre_grad = activated_grad;
        conv_pre_grad
            .iter_mut()
            .zip(pass.activated.iter())
            .for_each(|(g, &a)| *g *= 1.0 - a * a);

        let mut conv_w_grad = Array3::<f32>::zeros((channels, embed_dim, kernel));
        let mut conv_b_grad = Array1::<f32>::zeros(channels);
        let mut input_grad = Array3::<f32>::zeros((batch, width, embed_dim));
        for b in 0..batch {
            for o in 0..channels {
                for j in 0..conv_width {
                    let g = conv_pre_grad[[b, o, j]];
                    if g == 0.0 {
                        continue;
                    }
                    conv_b_grad[o] += g;
                    for k in 0..kernel {
                        let t = j * stride + k;
                        for i in 0..embed_dim {
                            conv_w_grad[[o, i, k]] += g * embedded[[b, t, i]];
                            input_grad[[b, t, i]] += g * self.params.conv_w[[o, i, k]];
                        }
                    }
                }
            }
        }

        BackwardPass {
            loss,
            input_grad,
            conv_w_grad,
            conv_b_grad,
            linear_w_grad,
            linear_b_grad,
        }
    }
}

/// Row-wise log-softmax.
fn log_softmax(logits: &Array2<f32>) -> Array2<f32> {
    let mut out = logits.clone();
    for mut row in out.rows_mut() {
        let max = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let log_sum = row.iter().map(|&v| (v - max).exp()).sum::<f32>().ln() + max;
        row.mapv_inplace(|v| v - log_sum);
    }
    out
}

/// Mean negative-log-likelihood of `targets` under `log_probs`.
pub fn nll_loss(log_probs: &Array2<f32>, targets: &[Label]) -> f32 {
    let mut total = 0.0;
    for (b, label) in targets.iter().enumerate() {
        total -= log_probs[[b, label.index()]];
    }
    total / targets.len() as f32
}

/// Predicted label per row: the class with the larger log-probability.
pub fn predicted_labels(log_probs: &Array2<f32>) -> Vec<Label> {
    log_probs
        .rows()
        .into_iter()
        .map(|row| {
            if row[1] > row[0] {
                Label::Malicious
            } else {
                Label::Benign
            }
        })
        .collect()
}
