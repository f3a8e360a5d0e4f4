//! Retraining Coordinator
//!
//! Collects labeled reports from the replay infrastructure, maintains the
//! shared corpus, retrains the model whenever new samples arrive, and
//! publishes fresh snapshots. A report's payload size decides its label:
//! short payloads are benign, long ones malicious. Running payload-size and
//! latency statistics flag distribution drift.

use std::fs;
use std::io::Read;
use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info, warn};

use crate::config::CoordinatorConfig;
use crate::corpus::{collate, Corpus, Label};
use crate::model::train::{test_step, train_step, Adam};
use crate::model::{ModelConfig, ScoringModel};
use crate::snapshot::SnapshotDir;
use crate::wire::{self, ReportHeader, WireError};

/// Streaming mean and standard deviation over observed values.
#[derive(Debug, Default, Clone, Copy)]
pub struct RunningStats {
    count: u64,
    sum: f64,
    sq_sum: f64,
}

impl RunningStats {
    pub fn push(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.sq_sum += value * value;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.sum / self.count as f64
    }

    /// Standard deviation, floored at 1.0 so early near-constant data does
    /// not flag every new value.
    pub fn stddev(&self) -> f64 {
        if self.count == 0 {
            return 1.0;
        }
        let mean = self.mean();
        let count = self.count as f64;
        let variance = (self.sq_sum - 2.0 * mean * self.sum + count * mean * mean) / count;
        variance.max(0.0).sqrt().max(1.0)
    }

    /// A value strictly more than three standard deviations from the mean
    /// is anomalous; a value at exactly three is not.
    pub fn is_anomalous(&self, value: f64) -> bool {
        if self.count == 0 {
            return false;
        }
        (value - self.mean()).abs() > 3.0 * self.stddev()
    }
}

#[derive(Default)]
struct Shared {
    corpus: Corpus,
    payload_sizes: RunningStats,
    latencies: RunningStats,
    latest_malicious: Option<String>,
    fresh_malicious: bool,
}

/// Persist an accepted report alongside the in-memory corpus, in the
/// `<seq>-<label>.txt` layout the offline `train`/`eval` commands read.
fn spill_sample(dir: &Path, seq: usize, label: Label, line: &str) {
    let path = dir.join(format!("{}-{}.txt", seq, label.index()));
    if let Err(error) = fs::write(&path, line) {
        warn!(%error, path = %path.display(), "corpus spill failed");
    }
}

fn handle_report<R: Read>(
    stream: &mut R,
    shared: &Mutex<Shared>,
    config: &CoordinatorConfig,
) -> Result<(), WireError> {
    let header = ReportHeader::read(stream)?;
    let payload = wire::read_report_payload(stream)?;
    let line = String::from_utf8(payload).map_err(|_| WireError::InvalidUtf8)?;

    let label = if line.len() < config.benign_size_threshold {
        Label::Benign
    } else {
        Label::Malicious
    };

    // Lock scope covers only the index and statistics updates; spill I/O
    // happens after the guard drops.
    let seq;
    {
        let mut guard = shared.lock();
        if let Err(error) = guard.corpus.insert(label, &line) {
            warn!(%error, id = header.id, "rejecting unencodable report");
            return Ok(());
        }
        seq = guard.corpus.len() - 1;
        let anomalous = guard.payload_sizes.is_anomalous(line.len() as f64);
        guard.payload_sizes.push(line.len() as f64);
        guard.latencies.push(header.latency_us as f64);

        match label {
            Label::Malicious => {
                info!(
                    id = header.id,
                    bytes = line.len(),
                    latency_us = header.latency_us,
                    anomalous,
                    "captured malicious report"
                );
                guard.latest_malicious = Some(line.clone());
                guard.fresh_malicious = true;
            }
            Label::Benign => {
                if anomalous {
                    debug!(
                        id = header.id,
                        bytes = line.len(),
                        "payload size drifted from running mean"
                    );
                }
            }
        }
    }

    if let Some(dir) = &config.corpus_spill_dir {
        spill_sample(dir, seq, label, &line);
    }
    Ok(())
}

fn report_listener(config: CoordinatorConfig, shared: Arc<Mutex<Shared>>) {
    let addr = config.report_listen_addr.clone();
    let listener = match TcpListener::bind(&addr) {
        Ok(listener) => listener,
        Err(error) => {
            warn!(%error, addr, "report listener failed to bind");
            return;
        }
    };
    info!(addr, "collecting reports");

    for stream in listener.incoming() {
        match stream {
            Ok(mut stream) => {
                if let Err(error) = handle_report(&mut stream, &shared, &config) {
                    warn!(%error, "rejecting malformed report");
                }
            }
            Err(error) => warn!(%error, "accept failed"),
        }
    }
}

fn notify_adversary(addr: &str, line: &str) {
    match TcpStream::connect(addr) {
        Ok(mut stream) => match wire::send_notice(&mut stream, line) {
            Ok(()) => info!(addr, bytes = line.len(), "handed captured line to probe generator"),
            Err(error) => warn!(%error, addr, "notice delivery failed"),
        },
        Err(error) => warn!(%error, addr, "probe generator unreachable"),
    }
}

fn training_loop(config: &CoordinatorConfig, shared: Arc<Mutex<Shared>>) -> Result<()> {
    let snapshot = SnapshotDir::new(&config.snapshot_dir);
    let mut rng = StdRng::from_entropy();

    let mut model = if snapshot.is_ready() {
        info!("resuming from published snapshot");
        snapshot.load()?
    } else {
        ScoringModel::new(ModelConfig::default(), &mut rng)
    };
    let mut optimizer = Adam::new(config.learning_rate, config.weight_decay);
    let kernel = model.config().kernel_size;

    let mut seen_benign = 0usize;
    let mut seen_malicious = 0usize;
    loop {
        let (benign, malicious) = {
            let guard = shared.lock();
            (
                guard.corpus.label_count(Label::Benign),
                guard.corpus.label_count(Label::Malicious),
            )
        };
        if benign == seen_benign && malicious == seen_malicious {
            thread::sleep(Duration::from_millis(config.poll_interval_ms));
            continue;
        }
        seen_benign = benign;
        seen_malicious = malicious;
        debug!(benign, malicious, "corpus grew, evaluating");

        let mut trained = false;
        loop {
            // Draw under the lock, evaluate outside it.
            let window = {
                let guard = shared.lock();
                guard
                    .corpus
                    .recent_window(config.eval_recent_malicious, config.eval_window)
            };
            if window.is_empty() {
                break;
            }
            let stats = test_step(&model, &collate(&window, kernel));
            info!(
                accuracy = stats.accuracy(),
                benign = %format!("{}/{}", stats.benign_correct, stats.benign_total),
                malicious = %format!("{}/{}", stats.malicious_correct, stats.malicious_total),
                "recent-window evaluation"
            );
            if stats.accuracy() >= config.accuracy_threshold {
                break;
            }

            trained = true;
            let drawn = {
                let guard = shared.lock();
                guard.corpus.balanced_batch(config.train_batch_size, &mut rng)
            };
            if drawn.is_empty() {
                break;
            }
            let step = train_step(&mut model, &collate(&drawn, kernel), &mut optimizer);
            debug!(loss = step.loss, "training step");
        }

        if trained || !snapshot.is_ready() {
            snapshot.publish(&model)?;
        }

        let handoff = {
            let mut guard = shared.lock();
            if guard.fresh_malicious {
                guard.fresh_malicious = false;
                guard.latest_malicious.clone()
            } else {
                None
            }
        };
        if let (Some(line), Some(addr)) = (handoff, config.adversary_addr.as_deref()) {
            notify_adversary(addr, &line);
        }
    }
}

/// Run the coordinator. Blocks forever: a background thread collects
/// reports while the calling thread retrains and publishes.
pub fn run_service(config: &CoordinatorConfig) -> Result<()> {
    let shared = Arc::new(Mutex::new(Shared::default()));

    let listener_shared = Arc::clone(&shared);
    let listener_config = config.clone();
    if let Some(dir) = &config.corpus_spill_dir {
        fs::create_dir_all(dir)
            .with_context(|| format!("creating spill directory {}", dir.display()))?;
    }
    thread::Builder::new()
        .name("reports".to_string())
        .spawn(move || report_listener(listener_config, listener_shared))
        .context("spawning report listener")?;

    training_loop(config, shared)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_stats_flag_nothing() {
        let stats = RunningStats::default();
        assert!(!stats.is_anomalous(1e9));
        assert_eq!(stats.stddev(), 1.0);
    }

    #[test]
    fn three_sigma_boundary_is_not_anomalous() {
        let mut stats = RunningStats::default();
        stats.push(0.0);
        stats.push(10.0);
        // mean 5, stddev 5.
        assert!(!stats.is_anomalous(20.0));
        assert!(stats.is_anomalous(20.1));
        assert!(!stats.is_anomalous(-10.0));
        assert!(stats.is_anomalous(-10.1));
    }

    #[test]
    fn stddev_is_floored_at_one() {
        let mut stats = RunningStats::default();
        for _ in 0..100 {
            stats.push(42.0);
        }
        assert_eq!(stats.stddev(), 1.0);
        assert!(!stats.is_anomalous(45.0));
        assert!(stats.is_anomalous(45.1));
    }

    #[test]
    fn handled_reports_land_in_corpus_and_spill_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = CoordinatorConfig {
            corpus_spill_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let shared = Mutex::new(Shared::default());

        let mut report = Vec::new();
        ReportHeader {
            id: 7,
            latency_us: 900,
        }
        .write(&mut report)
        .unwrap();
        report.extend_from_slice(b"GET / HTTP/1.1\n");

        handle_report(&mut std::io::Cursor::new(report), &shared, &config).unwrap();

        let guard = shared.lock();
        assert_eq!(guard.corpus.label_count(Label::Benign), 1);
        assert_eq!(guard.payload_sizes.count(), 1);
        assert!(dir.path().join("0-0.txt").exists());
    }

    #[test]
    fn spilled_samples_reload_as_a_corpus() {
        let dir = tempfile::tempdir().unwrap();
        spill_sample(dir.path(), 0, Label::Benign, "GET / HTTP/1.1\r\n");
        spill_sample(dir.path(), 1, Label::Malicious, &"x".repeat(1200));

        let corpus = Corpus::from_dir(dir.path()).unwrap();
        assert_eq!(corpus.len(), 2);
        assert_eq!(corpus.label_count(Label::Benign), 1);
        assert_eq!(corpus.label_count(Label::Malicious), 1);
    }

    #[test]
    fn running_moments_accumulate() {
        let mut stats = RunningStats::default();
        for v in [1.0, 2.0, 3.0, 4.0] {
            stats.push(v);
        }
        assert_eq!(stats.count(), 4);
        assert!((stats.mean() - 2.5).abs() < 1e-9);
        let expected = 1.25f64.sqrt().max(1.0);
        assert!((stats.stddev() - expected).abs() < 1e-9);
    }
}
