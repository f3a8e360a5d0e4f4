//! Adversarial Probe Generator
//!
//! Searches for a minimally perturbed variant of a malicious request line
//! that the current model scores as benign. The search descends the model's
//! input gradient in embedding space, restricted to a mask covering only the
//! perturbable header value, then projects the result back onto real
//! alphanumeric characters. Every search is budget-bounded and reports an
//! explicit outcome instead of looping until it wins.
//!
//! The service half of this module waits for retraining notices from the
//! coordinator, regenerates a probe against the fresh snapshot, writes it as
//! an artifact, and pings the replay client.

use std::fs;
use std::io::Write;
use std::net::{TcpListener, TcpStream};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use ndarray::{s, Array1, ArrayView1};
use rand::Rng;
use tracing::{debug, info, warn};

use crate::codec::{self, TokenId};
use crate::config::AdversaryConfig;
use crate::corpus::Label;
use crate::model::{predicted_labels, ScoringModel};
use crate::snapshot::SnapshotDir;
use crate::wire;

/// Result of one bounded search.
#[derive(Debug, Clone)]
pub enum SearchOutcome {
    /// The model now scores the perturbed line as benign.
    Evaded {
        /// Full token sequence of the evasive line.
        tokens: Vec<TokenId>,
        /// Number of mask positions whose token changed.
        changed: usize,
        /// Iterations spent.
        iterations: usize,
    },
    /// The budget ran out with the line still scored malicious.
    BudgetExhausted { iterations: usize },
}

fn is_boundary(token: TokenId) -> bool {
    [' ', '\n', '\r']
        .iter()
        .any(|&c| codec::token_of(c) == Some(token))
}

fn find_subsequence(haystack: &[TokenId], needle: &[TokenId]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Token positions the search may perturb: the first and last space-free
/// runs of the named header's value. Returns `None` if the header is absent
/// or its value is empty.
pub fn extract_mask(tokens: &[TokenId], header_name: &str) -> Option<Vec<usize>> {
    let needle: Vec<TokenId> = format!("{}: ", header_name)
        .chars()
        .map(|c| codec::token_of(c))
        .collect::<Option<_>>()?;
    let start = find_subsequence(tokens, &needle)? + needle.len();
    if start >= tokens.len() || is_boundary(tokens[start]) {
        return None; // empty header value
    }

    let mut begin_end = start;
    while begin_end + 1 < tokens.len() && !is_boundary(tokens[begin_end + 1]) {
        begin_end += 1;
    }

    let newline = codec::token_of('\n')?;
    let terminator = (start..tokens.len()).find(|&i| tokens[i] == newline)?;
    let mut end_last = terminator.checked_sub(1)?;
    if codec::token_of('\r') == Some(tokens[end_last]) {
        end_last = end_last.checked_sub(1)?;
    }
    let mut end_first = end_last;
    while end_first > start && !is_boundary(tokens[end_first - 1]) {
        end_first -= 1;
    }

    if begin_end < start || end_last < end_first {
        return None;
    }

    let mut mask: Vec<usize> = (start..=begin_end).chain(end_first..=end_last).collect();
    mask.sort_unstable();
    mask.dedup();
    Some(mask)
}

/// The named header's value within `line`, without its line terminator.
pub fn attack_value<'a>(line: &'a str, header_name: &str) -> Option<&'a str> {
    let prefix = format!("{}: ", header_name);
    let at = line.find(&prefix)? + prefix.len();
    let rest = &line[at..];
    let mut end = rest.find('\n')?;
    if rest[..end].ends_with('\r') {
        end -= 1;
    }
    (end > 0).then(|| &rest[..end])
}

/// The self-probing payload used before any real attack has been captured:
/// a long run of spaces book-ended by `x` runs, shaped like a catastrophic
/// backtracking trigger.
pub fn bootstrap_payload() -> String {
    let mut payload = String::with_capacity(32_000);
    payload.extend(std::iter::repeat('x').take(1000));
    payload.extend(std::iter::repeat(' ').take(30_000));
    payload.extend(std::iter::repeat('x').take(1000));
    debug_assert_eq!(payload.len(), 32_000);
    payload
}

fn sign(v: f32) -> f32 {
    if v > 0.0 {
        1.0
    } else if v < 0.0 {
        -1.0
    } else {
        0.0
    }
}

fn euclidean(a: ArrayView1<f32>, b: ArrayView1<f32>) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

/// Distance between the step direction a candidate embedding would induce
/// and the gradient's sign pattern. Smaller means the move tracks the
/// gradient more closely.
fn sign_match_distance(
    current: ArrayView1<f32>,
    candidate: ArrayView1<f32>,
    grad_sign: ArrayView1<f32>,
) -> f32 {
    current
        .iter()
        .zip(candidate.iter())
        .zip(grad_sign.iter())
        .map(|((&c, &n), &g)| {
            let d = sign(c - n) - g;
            d * d
        })
        .sum::<f32>()
        .sqrt()
}

/// Gradient-guided search over the masked positions of one request line.
pub struct Generator<'a> {
    model: &'a ScoringModel,
    budget: usize,
    keep_one_in: u32,
}

impl<'a> Generator<'a> {
    pub fn new(model: &'a ScoringModel, budget: usize, keep_one_in: u32) -> Self {
        Self {
            model,
            budget,
            keep_one_in: keep_one_in.max(1),
        }
    }

    /// Run the bounded search. `mask` holds the perturbable positions.
    pub fn run<R: Rng>(&self, tokens: &[TokenId], mask: &[usize], rng: &mut R) -> SearchOutcome {
        // The convolution needs at least one full kernel window.
        let mut tokens = tokens.to_vec();
        let kernel = self.model.config().kernel_size;
        if tokens.len() < kernel {
            tokens.resize(kernel, codec::PAD_TOKEN);
        }
        let mut embedded = self.model.embed_line(&tokens);
        let vocabulary = self.model.alnum_embeddings();
        let target = [Label::Benign];

        for iteration in 1..=self.budget {
            let (_, loss, grad) = self.model.input_gradient(&embedded, &target);

            for &pos in mask {
                // Perturb sparsely: changing one character at a time keeps
                // each step's effect attributable and the final edit small.
                if rng.gen_range(0..self.keep_one_in) != 0 {
                    continue;
                }
                let current = embedded.slice(s![0, pos, ..]).to_owned();
                let grad_sign = grad.slice(s![0, pos, ..]).mapv(sign);

                let mut best_dist = f32::INFINITY;
                let mut ties: Vec<&Array1<f32>> = Vec::new();
                for (_, candidate) in &vocabulary {
                    if euclidean(current.view(), candidate.view()) < 1e-6 {
                        continue;
                    }
                    let dist =
                        sign_match_distance(current.view(), candidate.view(), grad_sign.view());
                    if dist < best_dist {
                        ties.clear();
                        best_dist = dist;
                    }
                    if (dist - best_dist).abs() < 1e-6 {
                        ties.push(candidate);
                    }
                }
                if ties.is_empty() {
                    continue;
                }
                let pick = ties[rng.gen_range(0..ties.len())];
                embedded.slice_mut(s![0, pos, ..]).assign(pick);
            }

            let log_probs = self.model.forward_from_embedding(&embedded);
            let verdict = predicted_labels(&log_probs)[0];
            debug!(
                iteration,
                loss,
                benign_prob = log_probs[[0, 0]].exp(),
                "search step"
            );

            if verdict != Label::Malicious {
                let mut out = tokens.to_vec();
                let mut changed = 0;
                for &pos in mask {
                    let projected = self
                        .model
                        .nearest_token(&embedded.slice(s![0, pos, ..]).to_owned());
                    if projected != out[pos] {
                        changed += 1;
                    }
                    out[pos] = projected;
                }
                return SearchOutcome::Evaded {
                    tokens: out,
                    changed,
                    iterations: iteration,
                };
            }
        }

        SearchOutcome::BudgetExhausted {
            iterations: self.budget,
        }
    }
}

fn generate_from_line(config: &AdversaryConfig, line: &str) -> Result<String> {
    let snapshot = SnapshotDir::new(&config.snapshot_dir);
    let model = snapshot.load()?;
    let encoded = codec::encode(line)?;
    let mask = extract_mask(&encoded.tokens, &config.header_name)
        .with_context(|| format!("no perturbable {} header in captured line", config.header_name))?;

    let generator = Generator::new(&model, config.budget, config.keep_one_in);
    let mut rng = rand::thread_rng();
    match generator.run(&encoded.tokens, &mask, &mut rng) {
        SearchOutcome::Evaded {
            tokens,
            changed,
            iterations,
        } => {
            let evasive = codec::decode(&tokens);
            let value = attack_value(&evasive, &config.header_name)
                .context("evasive line lost its header value")?
                .to_owned();
            info!(changed, iterations, "found evasive variant");
            Ok(value)
        }
        SearchOutcome::BudgetExhausted { iterations } => {
            bail!("no evasive variant found within {} iterations", iterations)
        }
    }
}

fn notify_replay_client(addr: &str, index: usize) {
    match TcpStream::connect(addr) {
        Ok(mut stream) => {
            if let Err(error) = write!(stream, "{:4}", index) {
                warn!(%error, addr, "failed to notify replay client");
            }
        }
        Err(error) => warn!(%error, addr, "replay client unreachable"),
    }
}

/// Run the probe generator service.
///
/// Blocks forever: after each model-ready notice (and once at startup) it
/// searches for an evasive payload, writes it to the artifact directory, and
/// notifies the replay client with the artifact index.
pub fn run_service(config: &AdversaryConfig) -> Result<()> {
    fs::create_dir_all(&config.artifact_dir).with_context(|| {
        format!("creating artifact directory {}", config.artifact_dir.display())
    })?;
    let listener = TcpListener::bind(&config.listen_addr)
        .with_context(|| format!("binding {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, "probe generator listening");

    let mut captured: Option<String> = None;
    let mut index = 0usize;
    loop {
        let started = Instant::now();
        let payload = match &captured {
            None => Ok(bootstrap_payload()),
            Some(line) => generate_from_line(config, line),
        };

        match payload {
            Ok(value) => {
                let path = config.artifact_dir.join(format!("attack_{}.txt", index));
                fs::write(&path, &value)
                    .with_context(|| format!("writing {}", path.display()))?;
                info!(
                    index,
                    bytes = value.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "wrote probe artifact"
                );
                notify_replay_client(&config.replay_addr, index);
                index += 1;
            }
            Err(error) => warn!(%error, "probe generation failed"),
        }

        let (mut stream, peer) = listener.accept().context("accepting notice connection")?;
        match wire::recv_notice(&mut stream) {
            Ok(line) => {
                debug!(%peer, bytes = line.len(), "received captured request line");
                captured = Some(line);
            }
            Err(error) => warn!(%error, %peer, "malformed notice"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ModelConfig, ScoringModel};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn header_line(value: &str) -> String {
        format!(
            "GET / HTTP/1.1\r\nHost: upstream\r\nif-none-match: {}\r\nX-Unique-ID: 17\r\n\r\n",
            value
        )
    }

    fn encoded_mask(value: &str) -> (Vec<TokenId>, Vec<usize>, usize) {
        let line = header_line(value);
        let start = line.find("if-none-match: ").unwrap() + "if-none-match: ".len();
        let tokens = codec::encode(&line).unwrap().tokens;
        let mask = extract_mask(&tokens, "if-none-match").unwrap();
        (tokens, mask, start)
    }

    #[test]
    fn mask_covers_first_and_last_value_runs() {
        let (_, mask, start) = encoded_mask("abc   def");
        let expected: Vec<usize> = (start..start + 3).chain(start + 6..start + 9).collect();
        assert_eq!(mask, expected);
    }

    #[test]
    fn mask_positions_never_touch_header_syntax() {
        let (tokens, mask, _) = encoded_mask("etag1 etag2 etag3");
        for &pos in &mask {
            let ch = codec::ALPHABET[tokens[pos]];
            assert!(
                !matches!(ch, ' ' | '\r' | '\n' | ':'),
                "mask includes {:?} at {}",
                ch,
                pos
            );
        }
    }

    #[test]
    fn missing_header_yields_no_mask() {
        let line = "GET / HTTP/1.1\r\nHost: upstream\r\n\r\n";
        let tokens = codec::encode(line).unwrap().tokens;
        assert!(extract_mask(&tokens, "if-none-match").is_none());
    }

    #[test]
    fn attack_value_strips_terminators() {
        let line = header_line("abc def");
        assert_eq!(attack_value(&line, "if-none-match"), Some("abc def"));
        assert_eq!(attack_value(&line, "X-Unique-ID"), Some("17"));
        assert_eq!(attack_value(&line, "absent-header"), None);
    }

    #[test]
    fn bootstrap_payload_shape() {
        let payload = bootstrap_payload();
        assert_eq!(payload.len(), 32_000);
        assert!(payload.starts_with(&"x".repeat(1000)));
        assert!(payload.ends_with(&"x".repeat(1000)));
        assert_eq!(payload.matches(' ').count(), 30_000);
    }

    #[test]
    fn exhausted_budget_reports_instead_of_hanging() {
        let mut rng = StdRng::seed_from_u64(3);
        let model = ScoringModel::new(ModelConfig::default(), &mut rng);
        let (tokens, mask, _) = encoded_mask("deadbeef");

        let generator = Generator::new(&model, 1, 16);
        match generator.run(&tokens, &mask, &mut rng) {
            SearchOutcome::Evaded { iterations, .. }
            | SearchOutcome::BudgetExhausted { iterations } => assert_eq!(iterations, 1),
        }
    }

    #[test]
    fn evasion_only_changes_mask_positions() {
        let mut rng = StdRng::seed_from_u64(21);
        let model = ScoringModel::new(ModelConfig::default(), &mut rng);
        let (tokens, mask, _) = encoded_mask("cafebabe deadbeef");

        let generator = Generator::new(&model, 50, 4);
        if let SearchOutcome::Evaded {
            tokens: evaded,
            changed,
            ..
        } = generator.run(&tokens, &mask, &mut rng)
        {
            let diffs: Vec<usize> = tokens
                .iter()
                .zip(evaded.iter())
                .enumerate()
                .filter(|(_, (a, b))| a != b)
                .map(|(i, _)| i)
                .collect();
            assert!(diffs.iter().all(|p| mask.contains(p)), "{:?}", diffs);
            assert_eq!(diffs.len(), changed);
        }
    }
}
