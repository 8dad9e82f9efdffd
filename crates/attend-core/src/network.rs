//! Two-layer identity network trained on enrolled faces.
//!
//! Input is the classical LBP descriptor, the hidden layer is `tanh`, and the
//! output is a softmax over enrolled users. After training, the hidden
//! activations serve as the deep embedding: samples of one user are pulled
//! together because they must produce the same class.

use crate::alignment::FaceCrop;
use crate::lbp::lbp_features;
use image::{imageops, GrayImage, Luma};
use ndarray::{Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use thiserror::Error;

/// Ratio between the main and fine-tuning learning rates.
const FINE_TUNE_RATE_DIVISOR: f32 = 10.0;
/// Pixel shifts used for augmentation.
const AUGMENT_SHIFTS: [(i32, i32); 4] = [(2, 0), (-2, 0), (0, 2), (0, -2)];

#[derive(Error, Debug)]
pub enum TrainError {
    #[error("need at least {required} users to train the model (found {found})")]
    InsufficientUsers { required: usize, found: usize },
    #[error("training was cancelled")]
    Cancelled,
    #[error("training diverged (loss became {0})")]
    Diverged(f32),
    #[error("invalid training configuration: {0}")]
    InvalidConfig(String),
}

/// Hyper-parameters for [`fit`].
#[derive(Debug, Clone)]
pub struct TrainConfig {
    pub hidden: usize,
    pub epochs: usize,
    pub fine_tune_epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f32,
    pub seed: u64,
    pub min_classes: usize,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            hidden: 64,
            epochs: 15,
            fine_tune_epochs: 5,
            batch_size: 8,
            learning_rate: 0.05,
            seed: 42,
            min_classes: 2,
        }
    }
}

/// One enrolled user's training material.
pub struct TrainingExample {
    pub user_id: String,
    pub face: FaceCrop,
}

/// Weights of the identity network.
#[derive(Debug, Clone)]
pub struct Network {
    /// Per-feature mean of the training inputs.
    pub mean: Array1<f32>,
    /// Per-feature standard deviation of the training inputs (1.0 where constant).
    pub scale: Array1<f32>,
    /// hidden × input
    pub w1: Array2<f32>,
    pub b1: Array1<f32>,
    /// classes × hidden
    pub w2: Array2<f32>,
    pub b2: Array1<f32>,
}

impl Network {
    /// Xavier-uniform initialisation, with input standardisation fitted to `inputs`.
    pub fn init(inputs: &Array2<f32>, hidden: usize, classes: usize, rng: &mut StdRng) -> Self {
        let input = inputs.ncols();
        let mean = inputs
            .mean_axis(Axis(0))
            .unwrap_or_else(|| Array1::zeros(input));
        let scale = inputs
            .std_axis(Axis(0), 0.0)
            .mapv(|s| if s > 1e-6 { s } else { 1.0 });

        let mut xavier = |rows: usize, cols: usize| {
            let limit = (6.0 / (rows + cols) as f32).sqrt();
            Array2::from_shape_fn((rows, cols), |_| rng.gen_range(-limit..limit))
        };
        let w1 = xavier(hidden, input);
        let w2 = xavier(classes, hidden);
        Self {
            mean,
            scale,
            w1,
            b1: Array1::zeros(hidden),
            w2,
            b2: Array1::zeros(classes),
        }
    }

    pub fn input_dim(&self) -> usize {
        self.w1.ncols()
    }

    pub fn hidden_dim(&self) -> usize {
        self.w1.nrows()
    }

    pub fn classes(&self) -> usize {
        self.w2.nrows()
    }

    fn standardize(&self, inputs: &Array2<f32>) -> Array2<f32> {
        (inputs - &self.mean) / &self.scale
    }

    fn hidden_standardized(&self, standardized: &Array2<f32>) -> Array2<f32> {
        (standardized.dot(&self.w1.t()) + &self.b1).mapv(f32::tanh)
    }

    /// Hidden activations for a batch of raw descriptors (rows are samples).
    pub fn hidden(&self, inputs: &Array2<f32>) -> Array2<f32> {
        self.hidden_standardized(&self.standardize(inputs))
    }

    /// Class probabilities for a batch.
    pub fn probabilities(&self, hidden: &Array2<f32>) -> Array2<f32> {
        let mut logits = hidden.dot(&self.w2.t()) + &self.b2;
        for mut row in logits.rows_mut() {
            let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
            row.mapv_inplace(|v| (v - max).exp());
            let sum = row.sum();
            row.mapv_inplace(|v| v / sum);
        }
        logits
    }

    /// One SGD step on a mini-batch. Returns the mean cross-entropy before the update.
    fn step(&mut self, inputs: &Array2<f32>, labels: &[usize], learning_rate: f32) -> f32 {
        let batch = inputs.nrows() as f32;
        let standardized = self.standardize(inputs);
        let hidden = self.hidden_standardized(&standardized);
        let probs = self.probabilities(&hidden);

        let mut loss = 0.0f32;
        let mut d_logits = probs;
        for (row, &label) in labels.iter().enumerate() {
            loss -= d_logits[[row, label]].max(1e-12).ln();
            d_logits[[row, label]] -= 1.0;
        }
        d_logits.mapv_inplace(|v| v / batch);

        let grad_w2 = d_logits.t().dot(&hidden);
        let grad_b2 = d_logits.sum_axis(Axis(0));
        let d_hidden = d_logits.dot(&self.w2) * hidden.mapv(|h| 1.0 - h * h);
        let grad_w1 = d_hidden.t().dot(&standardized);
        let grad_b1 = d_hidden.sum_axis(Axis(0));

        self.w2.scaled_add(-learning_rate, &grad_w2);
        self.b2.scaled_add(-learning_rate, &grad_b2);
        self.w1.scaled_add(-learning_rate, &grad_w1);
        self.b1.scaled_add(-learning_rate, &grad_b1);

        loss / batch
    }
}

/// Outcome of a successful [`fit`].
#[derive(Debug)]
pub struct TrainReport {
    pub network: Network,
    /// User ids in class-index order.
    pub classes: Vec<String>,
    pub final_loss: f32,
    /// Training-set accuracy of the final network, in [0, 1].
    pub accuracy: f32,
    pub samples: usize,
    pub elapsed_ms: u128,
}

/// Horizontal flip, ±2 px shifts, and the flipped shifts: 10 crops per face.
pub fn augment(face: &GrayImage) -> Vec<GrayImage> {
    let flipped = imageops::flip_horizontal(face);
    let mut out = vec![face.clone(), flipped.clone()];
    for &(dx, dy) in &AUGMENT_SHIFTS {
        out.push(shift(face, dx, dy));
        out.push(shift(&flipped, dx, dy));
    }
    out
}

/// Translate an image, replicating edge pixels into the uncovered border.
fn shift(image: &GrayImage, dx: i32, dy: i32) -> GrayImage {
    let (w, h) = (image.width() as i32, image.height() as i32);
    GrayImage::from_fn(image.width(), image.height(), |x, y| {
        let sx = (x as i32 - dx).clamp(0, w - 1) as u32;
        let sy = (y as i32 - dy).clamp(0, h - 1) as u32;
        Luma([image.get_pixel(sx, sy)[0]])
    })
}

fn feature_matrix(rows: &[Vec<f32>]) -> Array2<f32> {
    let dim = rows.first().map_or(0, Vec::len);
    Array2::from_shape_fn((rows.len(), dim), |(r, c)| rows[r][c])
}

/// Train the identity network on one crop per user.
///
/// Runs `epochs` of mini-batch SGD at `learning_rate`, then `fine_tune_epochs`
/// at a tenth of it. `cancel` is polled between mini-batches.
pub fn fit(
    examples: &[TrainingExample],
    config: &TrainConfig,
    cancel: &AtomicBool,
) -> Result<TrainReport, TrainError> {
    if config.hidden == 0 || config.batch_size == 0 || config.epochs + config.fine_tune_epochs == 0 {
        return Err(TrainError::InvalidConfig(format!(
            "hidden={}, batch_size={}, epochs={}+{}",
            config.hidden, config.batch_size, config.epochs, config.fine_tune_epochs
        )));
    }

    let mut classes: Vec<String> = examples.iter().map(|e| e.user_id.clone()).collect();
    classes.sort();
    classes.dedup();
    if classes.len() < config.min_classes.max(2) {
        return Err(TrainError::InsufficientUsers {
            required: config.min_classes.max(2),
            found: classes.len(),
        });
    }

    let started = Instant::now();
    let mut features = Vec::new();
    let mut labels = Vec::new();
    for example in examples {
        let label = classes
            .binary_search(&example.user_id)
            .map_err(|_| TrainError::InvalidConfig(format!("unknown class {}", example.user_id)))?;
        for sample in augment(&example.face.pixels) {
            features.push(lbp_features(&sample));
            labels.push(label);
        }
    }
    let inputs = feature_matrix(&features);

    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut network = Network::init(&inputs, config.hidden, classes.len(), &mut rng);
    let mut order: Vec<usize> = (0..labels.len()).collect();
    let mut final_loss = f32::NAN;

    let schedule = std::iter::repeat(config.learning_rate)
        .take(config.epochs)
        .chain(std::iter::repeat(config.learning_rate / FINE_TUNE_RATE_DIVISOR).take(config.fine_tune_epochs));

    for (epoch, learning_rate) in schedule.enumerate() {
        order.shuffle(&mut rng);
        let mut epoch_loss = 0.0f32;
        let mut batches = 0usize;

        for chunk in order.chunks(config.batch_size) {
            if cancel.load(Ordering::Relaxed) {
                return Err(TrainError::Cancelled);
            }
            let batch = inputs.select(Axis(0), chunk);
            let batch_labels: Vec<usize> = chunk.iter().map(|&i| labels[i]).collect();
            epoch_loss += network.step(&batch, &batch_labels, learning_rate);
            batches += 1;
        }

        final_loss = epoch_loss / batches.max(1) as f32;
        if !final_loss.is_finite() {
            return Err(TrainError::Diverged(final_loss));
        }
        tracing::debug!(epoch, learning_rate, loss = final_loss, "training epoch");
    }

    let probs = network.probabilities(&network.hidden(&inputs));
    let correct = probs
        .rows()
        .into_iter()
        .zip(&labels)
        .filter(|(row, label)| {
            let predicted = row
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
                .map(|(i, _)| i);
            predicted == Some(**label)
        })
        .count();

    Ok(TrainReport {
        network,
        classes,
        final_loss,
        accuracy: correct as f32 / labels.len() as f32,
        samples: labels.len(),
        elapsed_ms: started.elapsed().as_millis(),
    })
}
