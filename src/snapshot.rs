//! Model Snapshot Directory
//!
//! Publishes and loads model snapshots through the filesystem. A snapshot is
//! a JSON-serialized model written atomically (temp file then rename) plus a
//! small ready marker. Consumers watch the marker's mtime: it is rewritten
//! after every publication, so a changed mtime means a fresh model is ready
//! to load.

use std::fs;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use tracing::info;

use crate::model::ScoringModel;

const MODEL_FILE: &str = "model.json";
const READY_FILE: &str = "ready";

/// Handle on a snapshot directory shared between the trainer and scorers.
#[derive(Debug, Clone)]
pub struct SnapshotDir {
    dir: PathBuf,
}

impl SnapshotDir {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    fn model_path(&self) -> PathBuf {
        self.dir.join(MODEL_FILE)
    }

    fn ready_path(&self) -> PathBuf {
        self.dir.join(READY_FILE)
    }

    /// Atomically publish `model` and refresh the ready marker.
    pub fn publish(&self, model: &ScoringModel) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating snapshot directory {}", self.dir.display()))?;

        let tmp_path = self.dir.join(format!("{}.tmp", MODEL_FILE));
        {
            let file = fs::File::create(&tmp_path)
                .with_context(|| format!("creating {}", tmp_path.display()))?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer(&mut writer, model).context("serializing model snapshot")?;
            writer.flush().context("flushing model snapshot")?;
        }
        fs::rename(&tmp_path, self.model_path())
            .with_context(|| format!("publishing {}", self.model_path().display()))?;

        // The marker is rewritten after the rename; its mtime is the
        // freshness signal.
        fs::write(self.ready_path(), b"ready\n")
            .with_context(|| format!("writing {}", self.ready_path().display()))?;

        info!(dir = %self.dir.display(), "published model snapshot");
        Ok(())
    }

    /// Load the most recently published model.
    pub fn load(&self) -> Result<ScoringModel> {
        let path = self.model_path();
        let file =
            fs::File::open(&path).with_context(|| format!("opening {}", path.display()))?;
        serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("parsing {}", path.display()))
    }

    /// Modification time of the ready marker, if it exists.
    pub fn marker_mtime(&self) -> Option<SystemTime> {
        fs::metadata(self.ready_path())
            .and_then(|m| m.modified())
            .ok()
    }

    /// True once both the model file and the ready marker exist.
    pub fn is_ready(&self) -> bool {
        self.model_path().exists() && self.ready_path().exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ModelConfig, ScoringModel};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::thread;
    use std::time::Duration;

    fn test_model() -> ScoringModel {
        let mut rng = StdRng::seed_from_u64(9);
        ScoringModel::new(ModelConfig::default(), &mut rng)
    }

    #[test]
    fn publish_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = SnapshotDir::new(dir.path());
        let model = test_model();

        assert!(!snapshot.is_ready());
        snapshot.publish(&model).unwrap();
        assert!(snapshot.is_ready());

        let loaded = snapshot.load().unwrap();
        let tokens = vec![0usize; 64];
        let a = model.forward_from_embedding(&model.embed_line(&tokens));
        let b = loaded.forward_from_embedding(&loaded.embed_line(&tokens));
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x, y);
        }
    }

    #[test]
    fn marker_mtime_tracks_publication() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = SnapshotDir::new(dir.path());
        let model = test_model();

        snapshot.publish(&model).unwrap();
        let first = snapshot.marker_mtime().unwrap();

        thread::sleep(Duration::from_millis(20));
        snapshot.publish(&model).unwrap();
        let second = snapshot.marker_mtime().unwrap();

        assert!(second >= first);
    }

    #[test]
    fn no_temporary_file_survives_publication() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = SnapshotDir::new(dir.path());
        snapshot.publish(&test_model()).unwrap();

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert!(names.iter().all(|n| !n.ends_with(".tmp")), "{:?}", names);
    }
}
