//! Service Configuration Types
//!
//! One config struct per long-running service. Defaults mirror the deployed
//! topology: the detector scores on 9001 and warns on 9002, the coordinator
//! collects reports on 9004, and the probe generator listens on 9101 while
//! notifying the replay client on 9100.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

fn default_snapshot_dir() -> PathBuf {
    PathBuf::from("build/model")
}

/// Detector service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Address for the frame-scoring listener.
    pub listen_addr: String,
    /// Port on the origin host that accepts warnings.
    pub warning_port: u16,
    /// Maximum request lines scored per forward pass.
    pub batch_size: usize,
    /// Directory watched for model snapshots.
    pub snapshot_dir: PathBuf,
    /// Sleep between readiness checks while no snapshot exists.
    pub poll_interval_ms: u64,
    /// Timeout for connecting to and writing a warning.
    pub warning_timeout_ms: u64,
    /// Header naming the origin server of a malicious request.
    pub origin_header: String,
    /// Header carrying the per-request id echoed in warnings.
    pub id_header: String,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:9001".to_string(),
            warning_port: 9002,
            batch_size: 32,
            snapshot_dir: default_snapshot_dir(),
            poll_interval_ms: 200,
            warning_timeout_ms: 1000,
            origin_header: "X-Server".to_string(),
            id_header: "X-Unique-ID".to_string(),
        }
    }
}

/// Coordinator service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Address for the report listener.
    pub report_listen_addr: String,
    /// Directory snapshots are published to.
    pub snapshot_dir: PathBuf,
    /// Probe generator to notify after each retraining round, if any.
    pub adversary_addr: Option<String>,
    /// Directory accepted reports are spilled to as corpus files, if any.
    pub corpus_spill_dir: Option<PathBuf>,
    /// Payloads shorter than this many bytes are labeled benign.
    pub benign_size_threshold: usize,
    /// Retraining stops once recent-window accuracy reaches this.
    pub accuracy_threshold: f64,
    /// Samples per balanced training batch.
    pub train_batch_size: usize,
    /// Newest malicious samples included in the evaluation window.
    pub eval_recent_malicious: usize,
    /// Total evaluation window size.
    pub eval_window: usize,
    /// Sleep between corpus-growth checks.
    pub poll_interval_ms: u64,
    pub learning_rate: f32,
    pub weight_decay: f32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            report_listen_addr: "0.0.0.0:9004".to_string(),
            snapshot_dir: default_snapshot_dir(),
            adversary_addr: None,
            corpus_spill_dir: None,
            benign_size_threshold: 1000,
            accuracy_threshold: 0.99,
            train_batch_size: 4,
            eval_recent_malicious: 8,
            eval_window: 16,
            poll_interval_ms: 1000,
            learning_rate: 0.01,
            weight_decay: 5e-4,
        }
    }
}

/// Probe generator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdversaryConfig {
    /// Address for model-ready notices from the coordinator.
    pub listen_addr: String,
    /// Replay client notified with each new probe's index.
    pub replay_addr: String,
    /// Directory the current model snapshot is loaded from.
    pub snapshot_dir: PathBuf,
    /// Directory probe artifacts are written to.
    pub artifact_dir: PathBuf,
    /// Header whose value the search is allowed to perturb.
    pub header_name: String,
    /// Maximum gradient-descent iterations per search.
    pub budget: usize,
    /// A masked position is perturbed with probability 1 in this many.
    pub keep_one_in: u32,
}

impl Default for AdversaryConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:9101".to_string(),
            replay_addr: "127.0.0.1:9100".to_string(),
            snapshot_dir: default_snapshot_dir(),
            artifact_dir: PathBuf::from("build/adversary"),
            header_name: "if-none-match".to_string(),
            budget: 500,
            keep_one_in: 16,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_deployed_ports() {
        assert_eq!(DetectorConfig::default().listen_addr, "0.0.0.0:9001");
        assert_eq!(DetectorConfig::default().warning_port, 9002);
        assert_eq!(
            CoordinatorConfig::default().report_listen_addr,
            "0.0.0.0:9004"
        );
        assert_eq!(AdversaryConfig::default().listen_addr, "0.0.0.0:9101");
        assert_eq!(AdversaryConfig::default().replay_addr, "127.0.0.1:9100");
    }

    #[test]
    fn configs_round_trip_through_json() {
        let detector = DetectorConfig::default();
        let text = serde_json::to_string(&detector).unwrap();
        let back: DetectorConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(back.batch_size, detector.batch_size);

        let coordinator = CoordinatorConfig::default();
        let text = serde_json::to_string(&coordinator).unwrap();
        let back: CoordinatorConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(back.benign_size_threshold, coordinator.benign_size_threshold);

        let adversary = AdversaryConfig::default();
        let text = serde_json::to_string(&adversary).unwrap();
        let back: AdversaryConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(back.budget, adversary.budget);
    }
}
