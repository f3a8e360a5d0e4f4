//! Spatial Pyramid Max Pooling
//!
//! Pools a variable-width feature map at several granularities (1, 2, ..., L
//! spans per level) and concatenates the results, producing a representation
//! whose width depends only on the level count and channel count, never on
//! the input width. Argmax positions are captured so the training step can
//! route gradients back to the winning activations.

use ndarray::{Array2, Array3};

/// Sentinel source index for a span that covered no valid positions.
pub const NO_SOURCE: usize = usize::MAX;

/// Total spans across levels `1..=levels`: 1 + 2 + ... + L.
pub fn grid_count(levels: usize) -> usize {
    levels * (levels + 1) / 2
}

/// Pooled representation plus the argmax position of every span.
#[derive(Debug)]
pub struct Pooled {
    /// Shape (batch, channels * grid_count).
    pub values: Array2<f32>,
    /// Time index of each span's maximum, or [`NO_SOURCE`].
    pub source: Array2<usize>,
}

/// Max-pool `activated` (batch, channels, width) over the pyramid.
///
/// Per level `l`, spans use kernel = stride = ceil(width / l) with implicit
/// negative-infinity padding of floor((kernel * l - width + 1) / 2) on each
/// side, yielding exactly `l` spans. Within a level the layout is
/// channel-major, matching a flattened (channels, l) block.
pub fn forward(activated: &Array3<f32>, levels: usize) -> Pooled {
    let (batch, channels, width) = activated.dim();
    let features = channels * grid_count(levels);

    let mut values = Array2::<f32>::zeros((batch, features));
    let mut source = Array2::<usize>::from_elem((batch, features), NO_SOURCE);

    for b in 0..batch {
        let mut feature = 0;
        for level in 1..=levels {
            let kernel = width.div_ceil(level);
            let pad = (kernel * level - width + 1) / 2;
            for c in 0..channels {
                for span in 0..level {
                    let start = (span * kernel) as isize - pad as isize;
                    let end = start + kernel as isize;
                    let lo = start.max(0) as usize;
                    let hi = (end.max(0) as usize).min(width);

                    let mut best = f32::NEG_INFINITY;
                    let mut best_at = NO_SOURCE;
                    for t in lo..hi {
                        let v = activated[[b, c, t]];
                        if v > best {
                            best = v;
                            best_at = t;
                        }
                    }
                    if best_at != NO_SOURCE {
                        values[[b, feature]] = best;
                        source[[b, feature]] = best_at;
                    }
                    feature += 1;
                }
            }
        }
    }

    Pooled { values, source }
}

/// Scatter pooled-output gradients back onto the activation map.
pub fn backward(
    grad_out: &Array2<f32>,
    source: &Array2<usize>,
    channels: usize,
    width: usize,
    levels: usize,
) -> Array3<f32> {
    let batch = grad_out.nrows();
    let mut grad = Array3::<f32>::zeros((batch, channels, width));

    for b in 0..batch {
        let mut feature = 0;
        for level in 1..=levels {
            for c in 0..channels {
                for _ in 0..level {
                    let t = source[[b, feature]];
                    if t != NO_SOURCE {
                        grad[[b, c, t]] += grad_out[[b, feature]];
                    }
                    feature += 1;
                }
            }
        }
    }

    grad
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    #[test]
    fn grid_count_is_triangular() {
        assert_eq!(grid_count(1), 1);
        assert_eq!(grid_count(3), 6);
        assert_eq!(grid_count(4), 10);
    }

    #[test]
    fn output_width_is_invariant_to_input_width() {
        let levels = 3;
        let channels = 16;
        for width in [5, 6, 7, 45, 128, 1000] {
            let x = Array3::<f32>::zeros((2, channels, width));
            let pooled = forward(&x, levels);
            assert_eq!(
                pooled.values.dim(),
                (2, channels * grid_count(levels)),
                "width {}",
                width
            );
        }
    }

    #[test]
    fn level_one_takes_the_global_max() {
        let mut x = Array3::<f32>::zeros((1, 1, 8));
        x[[0, 0, 5]] = 3.5;
        let pooled = forward(&x, 1);
        assert_eq!(pooled.values[[0, 0]], 3.5);
        assert_eq!(pooled.source[[0, 0]], 5);
    }

    #[test]
    fn spans_partition_the_width() {
        // width 6, level 2: kernel 3, no padding; spans [0,3) and [3,6).
        let mut x = Array3::<f32>::zeros((1, 1, 6));
        x[[0, 0, 1]] = 1.0;
        x[[0, 0, 4]] = 2.0;
        let pooled = forward(&x, 2);
        // level 1 span, then level 2 spans.
        assert_eq!(pooled.values[[0, 0]], 2.0);
        assert_eq!(pooled.values[[0, 1]], 1.0);
        assert_eq!(pooled.values[[0, 2]], 2.0);
    }

    #[test]
    fn backward_routes_to_argmax_only() {
        let mut x = Array3::<f32>::zeros((1, 2, 6));
        x[[0, 0, 2]] = 1.0;
        x[[0, 1, 5]] = 1.0;
        let pooled = forward(&x, 2);

        let grad_out = Array2::<f32>::ones((1, 2 * grid_count(2)));
        let grad = backward(&grad_out, &pooled.source, 2, 6, 2);

        // Channel 0's max at t=2 wins the level-1 span and one level-2 span.
        assert_eq!(grad[[0, 0, 2]], 2.0);
        assert_eq!(grad[[0, 1, 5]], 2.0);
        // A position that never won a span gets no gradient.
        assert_eq!(grad[[0, 0, 1]], 0.0);
    }
}
