//! Training and Evaluation Steps
//!
//! Adam-based optimization of the scoring model on collated batches, plus a
//! read-only evaluation step. A step with a non-finite loss leaves the
//! parameters untouched.

use ndarray::{Array1, Array2, Array3, Dimension};
use tracing::warn;

use super::{nll_loss, predicted_labels, Parameters, ScoringModel};
use crate::corpus::{Batch, Label};

/// Outcome of one train or test step.
#[derive(Debug, Clone)]
pub struct StepStats {
    pub loss: f32,
    pub benign_correct: usize,
    pub benign_total: usize,
    pub malicious_correct: usize,
    pub malicious_total: usize,
    /// Predicted label per batch row, in collated order.
    pub predictions: Vec<Label>,
}

impl StepStats {
    fn from_output(log_probs: &Array2<f32>, labels: &[Label], loss: f32) -> Self {
        let predictions = predicted_labels(log_probs);
        let mut stats = StepStats {
            loss,
            benign_correct: 0,
            benign_total: 0,
            malicious_correct: 0,
            malicious_total: 0,
            predictions,
        };
        for (predicted, &actual) in stats.predictions.iter().zip(labels) {
            match actual {
                Label::Benign => {
                    stats.benign_total += 1;
                    if *predicted == actual {
                        stats.benign_correct += 1;
                    }
                }
                Label::Malicious => {
                    stats.malicious_total += 1;
                    if *predicted == actual {
                        stats.malicious_correct += 1;
                    }
                }
            }
        }
        stats
    }

    /// Fraction of rows classified correctly. 1.0 for an empty batch.
    pub fn accuracy(&self) -> f64 {
        let total = self.benign_total + self.malicious_total;
        if total == 0 {
            return 1.0;
        }
        (self.benign_correct + self.malicious_correct) as f64 / total as f64
    }

    /// Fold another step's counts into this one. Losses are summed.
    pub fn merge(&mut self, other: &StepStats) {
        self.loss += other.loss;
        self.benign_correct += other.benign_correct;
        self.benign_total += other.benign_total;
        self.malicious_correct += other.malicious_correct;
        self.malicious_total += other.malicious_total;
        self.predictions.extend_from_slice(&other.predictions);
    }
}

/// First and second moment estimates for one tensor.
#[derive(Debug, Clone)]
struct Moment<D: Dimension> {
    m: ndarray::Array<f32, D>,
    v: ndarray::Array<f32, D>,
}

impl<D: Dimension> Moment<D> {
    fn like(shape: D) -> Self {
        Self {
            m: ndarray::Array::zeros(shape.clone()),
            v: ndarray::Array::zeros(shape),
        }
    }
}

#[derive(Debug, Clone)]
struct Moments {
    embedding: Moment<ndarray::Ix2>,
    conv_w: Moment<ndarray::Ix3>,
    conv_b: Moment<ndarray::Ix1>,
    linear_w: Moment<ndarray::Ix2>,
    linear_b: Moment<ndarray::Ix1>,
}

/// Adam optimizer. L2 weight decay is folded into the gradient before the
/// moment updates.
#[derive(Debug, Clone)]
pub struct Adam {
    pub learning_rate: f32,
    pub weight_decay: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    step: u64,
    moments: Option<Moments>,
}

impl Adam {
    pub fn new(learning_rate: f32, weight_decay: f32) -> Self {
        Self {
            learning_rate,
            weight_decay,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            step: 0,
            moments: None,
        }
    }

    fn apply(&mut self, params: &mut Parameters, grads: &Gradients) {
        let moments = self.moments.get_or_insert_with(|| Moments {
            embedding: Moment::like(params.embedding.raw_dim()),
            conv_w: Moment::like(params.conv_w.raw_dim()),
            conv_b: Moment::like(params.conv_b.raw_dim()),
            linear_w: Moment::like(params.linear_w.raw_dim()),
            linear_b: Moment::like(params.linear_b.raw_dim()),
        });
        self.step += 1;
        let bias1 = 1.0 - self.beta1.powi(self.step as i32);
        let bias2 = 1.0 - self.beta2.powi(self.step as i32);

        update_tensor(
            &mut params.embedding,
            &grads.embedding,
            &mut moments.embedding,
            self.learning_rate,
            self.weight_decay,
            self.beta1,
            self.beta2,
            self.epsilon,
            bias1,
            bias2,
        );
        update_tensor(
            &mut params.conv_w,
            &grads.conv_w,
            &mut moments.conv_w,
            self.learning_rate,
            self.weight_decay,
            self.beta1,
            self.beta2,
            self.epsilon,
            bias1,
            bias2,
        );
        update_tensor(
            &mut params.conv_b,
            &grads.conv_b,
            &mut moments.conv_b,
            self.learning_rate,
            self.weight_decay,
            self.beta1,
            self.beta2,
            self.epsilon,
            bias1,
            bias2,
        );
        update_tensor(
            &mut params.linear_w,
            &grads.linear_w,
            &mut moments.linear_w,
            self.learning_rate,
            self.weight_decay,
            self.beta1,
            self.beta2,
            self.epsilon,
            bias1,
            bias2,
        );
        update_tensor(
            &mut params.linear_b,
            &grads.linear_b,
            &mut moments.linear_b,
            self.learning_rate,
            self.weight_decay,
            self.beta1,
            self.beta2,
            self.epsilon,
            bias1,
            bias2,
        );
    }
}

#[allow(clippy::too_many_arguments)]
fn update_tensor<D: Dimension>(
    param: &mut ndarray::Array<f32, D>,
    grad: &ndarray::Array<f32, D>,
    moment: &mut Moment<D>,
    learning_rate: f32,
    weight_decay: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    bias1: f32,
    bias2: f32,
) {
    for (((p, &g0), m), v) in param
        .iter_mut()
        .zip(grad.iter())
        .zip(moment.m.iter_mut())
        .zip(moment.v.iter_mut())
    {
        let g = g0 + weight_decay * *p;
        *m = beta1 * *m + (1.0 - beta1) * g;
        *v = beta2 * *v + (1.0 - beta2) * g * g;
        let m_hat = *m / bias1;
        let v_hat = *v / bias2;
        *p -= learning_rate * m_hat / (v_hat.sqrt() + epsilon);
    }
}

struct Gradients {
    embedding: Array2<f32>,
    conv_w: Array3<f32>,
    conv_b: Array1<f32>,
    linear_w: Array2<f32>,
    linear_b: Array1<f32>,
}

/// Run one optimization step on `batch`, returning step statistics.
pub fn train_step(model: &mut ScoringModel, batch: &Batch, optimizer: &mut Adam) -> StepStats {
    let embedded = model.embed(batch);
    let pass = model.run_forward(&embedded);
    let back = model.backward_from(&embedded, &pass, &batch.labels);
    let stats = StepStats::from_output(&pass.log_probs, &batch.labels, back.loss);

    if !back.loss.is_finite() {
        warn!(loss = back.loss, "non-finite loss, skipping parameter update");
        return stats;
    }

    // Scatter the input gradient back onto the embedding rows each token
    // actually used.
    let embed_dim = model.config().embed_dim;
    let mut embedding_grad = Array2::<f32>::zeros((model.config().vocab_size, embed_dim));
    let (rows, width) = batch.tokens.dim();
    for b in 0..rows {
        for t in 0..width {
            let token = batch.tokens[[b, t]];
            for i in 0..embed_dim {
                embedding_grad[[token, i]] += back.input_grad[[b, t, i]];
            }
        }
    }

    let grads = Gradients {
        embedding: embedding_grad,
        conv_w: back.conv_w_grad,
        conv_b: back.conv_b_grad,
        linear_w: back.linear_w_grad,
        linear_b: back.linear_b_grad,
    };
    optimizer.apply(model.params_mut(), &grads);
    stats
}

/// Evaluate `batch` without touching the parameters.
pub fn test_step(model: &ScoringModel, batch: &Batch) -> StepStats {
    let log_probs = model.forward(batch);
    let loss = nll_loss(&log_probs, &batch.labels);
    StepStats::from_output(&log_probs, &batch.labels, loss)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::{collate, Corpus, Label};
    use crate::model::ModelConfig;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn tiny_setup() -> (ScoringModel, Batch) {
        let mut rng = StdRng::seed_from_u64(11);
        let model = ScoringModel::new(ModelConfig::default(), &mut rng);

        let mut corpus = Corpus::new();
        for i in 0..4 {
            corpus
                .insert(Label::Benign, &format!("GET /item/{} HTTP/1.1\r\n\r\n", i))
                .unwrap();
        }
        for i in 0..4 {
            corpus
                .insert(Label::Malicious, &"z".repeat(1100 + i))
                .unwrap();
        }
        let batch = collate(&corpus.chunked(corpus.len()).remove(0), 64);
        (model, batch)
    }

    #[test]
    fn training_reduces_loss_on_a_fixed_batch() {
        let (mut model, batch) = tiny_setup();
        let mut optimizer = Adam::new(0.01, 5e-4);

        let first = train_step(&mut model, &batch, &mut optimizer);
        let mut last = first.clone();
        for _ in 0..30 {
            last = train_step(&mut model, &batch, &mut optimizer);
        }

        assert!(
            last.loss < first.loss,
            "loss did not decrease: {} -> {}",
            first.loss,
            last.loss
        );
        assert_eq!(last.accuracy(), 1.0);
    }

    #[test]
    fn test_step_does_not_mutate_parameters() {
        let (model, batch) = tiny_setup();
        let before = model.forward(&batch);

        test_step(&model, &batch);
        let after = model.forward(&batch);

        for (a, b) in before.iter().zip(after.iter()) {
            assert_eq!(a, b);
        }
    }

    #[test]
    fn stats_count_per_class_totals() {
        let (model, batch) = tiny_setup();
        let stats = test_step(&model, &batch);

        assert_eq!(stats.benign_total, 4);
        assert_eq!(stats.malicious_total, 4);
        assert_eq!(stats.predictions.len(), 8);
    }

    #[test]
    fn merge_accumulates_counts() {
        let (model, batch) = tiny_setup();
        let mut total = test_step(&model, &batch);
        let again = test_step(&model, &batch);
        total.merge(&again);

        assert_eq!(total.benign_total, 8);
        assert_eq!(total.malicious_total, 8);
        assert_eq!(total.predictions.len(), 16);
    }
}
