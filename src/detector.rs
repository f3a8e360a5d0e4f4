//! Detection Service
//!
//! Scores request lines streamed over TCP and warns origin servers about
//! the malicious ones. Three moving parts, connected by channels:
//!
//! - the accept loop reads length-prefixed frames from proxy connections,
//! - the classifier thread batches lines, scores them with the latest
//!   snapshot, and reloads the model when the ready marker changes,
//! - the warning thread delivers request ids to origin servers, recording
//!   an explicit delivery outcome per attempt.

use std::io::Write;
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::codec;
use crate::config::DetectorConfig;
use crate::corpus::{collate, Label, Sample};
use crate::model::{predicted_labels, ScoringModel};
use crate::snapshot::SnapshotDir;
use crate::wire::{self, WireError};

/// Outcome of one warning delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    TimedOut,
    Refused,
    Failed,
}

/// Value of the named header within a raw request line, up to its line
/// terminator or the end of input.
pub fn header_value<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let prefix = format!("{}: ", name);
    let at = line.find(&prefix)? + prefix.len();
    let rest = &line[at..];
    let end = rest.find(['\r', '\n']).unwrap_or(rest.len());
    Some(&rest[..end])
}

/// Deliver a warning carrying `id` to `origin` on the warning port.
pub fn send_warning(origin: &str, port: u16, id: &str, timeout: Duration) -> Delivery {
    let addr = match (origin, port).to_socket_addrs().ok().and_then(|mut a| a.next()) {
        Some(addr) => addr,
        None => return Delivery::Failed,
    };
    let mut stream = match TcpStream::connect_timeout(&addr, timeout) {
        Ok(stream) => stream,
        Err(e) if e.kind() == std::io::ErrorKind::TimedOut => return Delivery::TimedOut,
        Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => return Delivery::Refused,
        Err(_) => return Delivery::Failed,
    };
    if stream.set_write_timeout(Some(timeout)).is_err() {
        return Delivery::Failed;
    }
    match stream.write_all(id.as_bytes()) {
        Ok(()) => Delivery::Delivered,
        Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Delivery::TimedOut,
        Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => Delivery::Refused,
        Err(_) => Delivery::Failed,
    }
}

/// Score `lines` with `model`, pairing each kept line with its verdict.
/// Lines outside the vocabulary are skipped individually.
pub fn classify(model: &ScoringModel, lines: &[String]) -> Vec<(String, Label)> {
    let mut kept: Vec<String> = Vec::with_capacity(lines.len());
    let mut samples: Vec<Sample> = Vec::with_capacity(lines.len());
    for line in lines {
        match codec::encode(line) {
            Ok(encoded) => {
                let length = encoded.tokens.len();
                kept.push(line.clone());
                samples.push(Sample {
                    // Placeholder; ground truth is unknown at scoring time.
                    label: Label::Benign,
                    tokens: encoded.tokens,
                    length,
                });
            }
            Err(error) => warn!(%error, "dropping unencodable request line"),
        }
    }
    if samples.is_empty() {
        return Vec::new();
    }

    // Collation sorts by length; score the rows in collated order and map
    // verdicts back through the lengths.
    let mut order: Vec<usize> = (0..samples.len()).collect();
    order.sort_by(|&a, &b| samples[b].length.cmp(&samples[a].length));

    let batch = collate(&samples, model.config().kernel_size);
    let verdicts = predicted_labels(&model.forward(&batch));

    order
        .into_iter()
        .zip(verdicts)
        .map(|(original, label)| (kept[original].clone(), label))
        .collect()
}

fn ingest_connection(stream: TcpStream, tasks: mpsc::Sender<String>) {
    let mut stream = stream;
    loop {
        match wire::read_frame(&mut stream) {
            Ok(line) => {
                if tasks.send(line).is_err() {
                    return;
                }
            }
            Err(WireError::Truncated) => {
                debug!("peer closed scoring connection");
                return;
            }
            Err(error) => {
                warn!(%error, "closing scoring connection");
                return;
            }
        }
    }
}

fn reload_if_stale(
    snapshot: &SnapshotDir,
    model: &mut ScoringModel,
    loaded_mtime: &mut Option<SystemTime>,
) {
    let current = snapshot.marker_mtime();
    if current == *loaded_mtime {
        return;
    }
    match snapshot.load() {
        Ok(fresh) => {
            *model = fresh;
            *loaded_mtime = current;
            info!("reloaded model snapshot");
        }
        Err(error) => warn!(%error, "snapshot reload failed, keeping previous model"),
    }
}

fn classification_worker(
    config: DetectorConfig,
    tasks: mpsc::Receiver<String>,
    warnings: mpsc::Sender<String>,
) {
    let snapshot = SnapshotDir::new(&config.snapshot_dir);
    while !snapshot.is_ready() {
        thread::sleep(Duration::from_millis(config.poll_interval_ms));
    }
    let mut model = match snapshot.load() {
        Ok(model) => model,
        Err(error) => {
            warn!(%error, "initial snapshot load failed");
            return;
        }
    };
    let mut loaded_mtime = snapshot.marker_mtime();
    info!("classifier ready");

    let mut scored_total: u64 = 0;
    loop {
        // Block for the first item so an idle service does not spin.
        let first = match tasks.recv() {
            Ok(line) => line,
            Err(_) => return,
        };
        let mut lines = vec![first];
        while lines.len() < config.batch_size {
            match tasks.try_recv() {
                Ok(line) => lines.push(line),
                Err(_) => break,
            }
        }

        reload_if_stale(&snapshot, &mut model, &mut loaded_mtime);

        let scored = classify(&model, &lines);
        scored_total += scored.len() as u64;
        debug!(batch = scored.len(), scored_total, "scored batch");

        for (line, label) in scored {
            if label == Label::Malicious && warnings.send(line).is_err() {
                return;
            }
        }
    }
}

fn warning_worker(config: DetectorConfig, warnings: mpsc::Receiver<String>) {
    let timeout = Duration::from_millis(config.warning_timeout_ms);
    while let Ok(line) = warnings.recv() {
        let origin = header_value(&line, &config.origin_header);
        let id = header_value(&line, &config.id_header);
        let (origin, id) = match (origin, id) {
            (Some(origin), Some(id)) => (origin, id),
            _ => {
                warn!(
                    origin_header = %config.origin_header,
                    id_header = %config.id_header,
                    "malicious line lacks warning headers"
                );
                continue;
            }
        };

        match send_warning(origin, config.warning_port, id, timeout) {
            Delivery::Delivered => info!(origin, id, "warned origin server"),
            outcome => warn!(origin, id, ?outcome, "warning dropped"),
        }
    }
}

/// Run the detection service. Blocks forever accepting proxy connections.
pub fn run_service(config: &DetectorConfig) -> Result<()> {
    let (task_tx, task_rx) = mpsc::channel::<String>();
    let (warn_tx, warn_rx) = mpsc::channel::<String>();

    let classifier_config = config.clone();
    thread::Builder::new()
        .name("classifier".to_string())
        .spawn(move || classification_worker(classifier_config, task_rx, warn_tx))
        .context("spawning classifier thread")?;

    let warning_config = config.clone();
    thread::Builder::new()
        .name("warning".to_string())
        .spawn(move || warning_worker(warning_config, warn_rx))
        .context("spawning warning thread")?;

    let listener = TcpListener::bind(&config.listen_addr)
        .with_context(|| format!("binding {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, "detector listening");

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let tasks = task_tx.clone();
                thread::spawn(move || ingest_connection(stream, tasks));
            }
            Err(error) => warn!(%error, "accept failed"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelConfig;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::io::Read;

    #[test]
    fn header_value_handles_both_terminators() {
        let line = "GET / HTTP/1.1\r\nX-Server: origin-3\r\nX-Unique-ID: 99\n";
        assert_eq!(header_value(line, "X-Server"), Some("origin-3"));
        assert_eq!(header_value(line, "X-Unique-ID"), Some("99"));
        assert_eq!(header_value(line, "Missing"), None);
    }

    #[test]
    fn header_value_without_terminator_runs_to_end() {
        let line = "X-Unique-ID: 1234";
        assert_eq!(header_value(line, "X-Unique-ID"), Some("1234"));
    }

    #[test]
    fn classify_maps_verdicts_back_to_input_lines() {
        let mut rng = StdRng::seed_from_u64(13);
        let model = ScoringModel::new(ModelConfig::default(), &mut rng);
        let lines = vec![
            "GET /a HTTP/1.1\r\n".to_string(),
            "m".repeat(2000),
            "GET /b HTTP/1.1\r\n".to_string(),
        ];

        let scored = classify(&model, &lines);
        assert_eq!(scored.len(), 3);
        let mut seen: Vec<&str> = scored.iter().map(|(l, _)| l.as_str()).collect();
        seen.sort_unstable();
        let mut expected: Vec<&str> = lines.iter().map(String::as_str).collect();
        expected.sort_unstable();
        assert_eq!(seen, expected);
    }

    #[test]
    fn classify_rejects_unencodable_lines_individually() {
        let mut rng = StdRng::seed_from_u64(14);
        let model = ScoringModel::new(ModelConfig::default(), &mut rng);
        let lines = vec![
            "GET /ok HTTP/1.1\r\n".to_string(),
            "bad\u{2603}".to_string(),
        ];

        let scored = classify(&model, &lines);
        assert_eq!(scored.len(), 1);
        assert_eq!(scored[0].0, "GET /ok HTTP/1.1\r\n");
    }

    #[test]
    fn warning_refused_when_nothing_listens() {
        let outcome = send_warning("127.0.0.1", 1, "77", Duration::from_millis(200));
        assert!(matches!(outcome, Delivery::Refused | Delivery::TimedOut));
    }

    #[test]
    fn warning_delivers_id_bytes() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut body = String::new();
            stream.read_to_string(&mut body).unwrap();
            body
        });

        let outcome = send_warning("127.0.0.1", port, "1234", Duration::from_millis(500));
        assert_eq!(outcome, Delivery::Delivered);
        assert_eq!(handle.join().unwrap(), "1234");
    }
}
