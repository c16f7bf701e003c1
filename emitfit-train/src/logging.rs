//! Experiment logging sinks.
//!
//! [`TrainLogger`] is what the training and evaluation drivers write to.
//! [`TracingLogger`] forwards everything as `tracing` events,
//! [`JsonlLogger`] appends one JSON event per line to a file,
//! [`MemoryLogger`] keeps events for inspection and [`MultiLogger`] fans
//! out to several sinks.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use emitfit_core::{DetectionSet, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::training::evaluate::{MatchStats, ValidationReport};

pub trait TrainLogger: Send {
    fn add_scalar(&mut self, name: &str, value: f64, step: usize) -> Result<()>;

    fn add_text(&mut self, name: &str, text: &str) -> Result<()>;

    /// Records the network structure. Failing here never stops training.
    fn add_graph(&mut self, structure: &str) -> Result<()>;

    fn log_validation(&mut self, report: &ValidationReport, epoch: usize) -> Result<()>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Summary of a [`ValidationReport`] suitable for serialisation. The frame
/// tensors are left out; the detection sets are kept whole.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationSummary {
    pub metric: f64,
    pub per_head_loss: Vec<f64>,
    pub samples: usize,
    pub predictions: DetectionSet,
    pub ground_truth: DetectionSet,
    pub matching: MatchStats,
}

impl From<&ValidationReport> for ValidationSummary {
    fn from(report: &ValidationReport) -> Self {
        Self {
            metric: report.metric,
            per_head_loss: report.per_head_loss.clone(),
            samples: report.samples,
            predictions: report.predictions.clone(),
            ground_truth: report.ground_truth.clone(),
            matching: report.matching.clone(),
        }
    }
}

/// One logged event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogEvent {
    Scalar {
        name: String,
        value: f64,
        step: usize,
    },
    Text {
        name: String,
        text: String,
    },
    Graph {
        structure: String,
    },
    Validation {
        epoch: usize,
        summary: ValidationSummary,
    },
}

/// Forwards events to the `tracing` subscriber.
#[derive(Debug, Clone, Default)]
pub struct TracingLogger;

impl TrainLogger for TracingLogger {
    fn add_scalar(&mut self, name: &str, value: f64, step: usize) -> Result<()> {
        tracing::debug!(target: "emitfit::scalars", name, value, step);
        Ok(())
    }

    fn add_text(&mut self, name: &str, text: &str) -> Result<()> {
        tracing::info!(name, "{text}");
        Ok(())
    }

    fn add_graph(&mut self, structure: &str) -> Result<()> {
        tracing::debug!("network structure:\n{structure}");
        Ok(())
    }

    fn log_validation(&mut self, report: &ValidationReport, epoch: usize) -> Result<()> {
        let m = &report.matching;
        tracing::info!(
            epoch,
            metric = report.metric,
            precision = m.precision,
            recall = m.recall,
            jaccard = m.jaccard,
            rmse_lateral = m.rmse_lateral,
            predicted = report.predictions.len(),
            ground_truth = report.ground_truth.len(),
            "validation"
        );
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct JsonlLine<'a> {
    run_id: Uuid,
    sequence: usize,
    timestamp: DateTime<Utc>,
    #[serde(flatten)]
    event: &'a LogEvent,
}

/// Appends JSON lines to a file, tagged with a per-run id.
#[derive(Debug)]
pub struct JsonlLogger {
    run_id: Uuid,
    sequence: usize,
    writer: BufWriter<File>,
}

impl JsonlLogger {
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let run_id = Uuid::new_v4();
        tracing::info!(path = %path.display(), %run_id, "writing scalars");
        Ok(Self {
            run_id,
            sequence: 0,
            writer: BufWriter::new(file),
        })
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    fn write(&mut self, event: &LogEvent) -> Result<()> {
        let line = JsonlLine {
            run_id: self.run_id,
            sequence: self.sequence,
            timestamp: Utc::now(),
            event,
        };
        serde_json::to_writer(&mut self.writer, &line)?;
        self.writer.write_all(b"\n")?;
        self.sequence += 1;
        Ok(())
    }
}

impl TrainLogger for JsonlLogger {
    fn add_scalar(&mut self, name: &str, value: f64, step: usize) -> Result<()> {
        self.write(&LogEvent::Scalar {
            name: name.to_string(),
            value,
            step,
        })
    }

    fn add_text(&mut self, name: &str, text: &str) -> Result<()> {
        self.write(&LogEvent::Text {
            name: name.to_string(),
            text: text.to_string(),
        })
    }

    fn add_graph(&mut self, structure: &str) -> Result<()> {
        self.write(&LogEvent::Graph {
            structure: structure.to_string(),
        })
    }

    fn log_validation(&mut self, report: &ValidationReport, epoch: usize) -> Result<()> {
        self.write(&LogEvent::Validation {
            epoch,
            summary: report.into(),
        })?;
        self.flush()
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

impl Drop for JsonlLogger {
    fn drop(&mut self) {
        if let Err(e) = self.writer.flush() {
            tracing::warn!("failed to flush scalars file: {e}");
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryLogger {
    pub events: Vec<LogEvent>,
}

impl MemoryLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(step, value)` pairs logged under `name`, in order.
    pub fn scalars(&self, name: &str) -> Vec<(usize, f64)> {
        self.events
            .iter()
            .filter_map(|e| match e {
                LogEvent::Scalar {
                    name: n,
                    value,
                    step,
                } if n == name => Some((*step, *value)),
                _ => None,
            })
            .collect()
    }

    /// Texts logged under `name`, in order.
    pub fn texts(&self, name: &str) -> Vec<&str> {
        self.events
            .iter()
            .filter_map(|e| match e {
                LogEvent::Text { name: n, text } if n == name => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn validations(&self) -> Vec<(usize, &ValidationSummary)> {
        self.events
            .iter()
            .filter_map(|e| match e {
                LogEvent::Validation { epoch, summary } => Some((*epoch, summary)),
                _ => None,
            })
            .collect()
    }

    pub fn graphs(&self) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e, LogEvent::Graph { .. }))
            .count()
    }
}

impl TrainLogger for MemoryLogger {
    fn add_scalar(&mut self, name: &str, value: f64, step: usize) -> Result<()> {
        self.events.push(LogEvent::Scalar {
            name: name.to_string(),
            value,
            step,
        });
        Ok(())
    }

    fn add_text(&mut self, name: &str, text: &str) -> Result<()> {
        self.events.push(LogEvent::Text {
            name: name.to_string(),
            text: text.to_string(),
        });
        Ok(())
    }

    fn add_graph(&mut self, structure: &str) -> Result<()> {
        self.events.push(LogEvent::Graph {
            structure: structure.to_string(),
        });
        Ok(())
    }

    fn log_validation(&mut self, report: &ValidationReport, epoch: usize) -> Result<()> {
        self.events.push(LogEvent::Validation {
            epoch,
            summary: report.into(),
        });
        Ok(())
    }
}

/// Fans every call out to all sinks, stopping at the first error.
#[derive(Default)]
pub struct MultiLogger {
    sinks: Vec<Box<dyn TrainLogger>>,
}

impl MultiLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: impl TrainLogger + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    pub fn push(&mut self, sink: Box<dyn TrainLogger>) {
        self.sinks.push(sink);
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl TrainLogger for MultiLogger {
    fn add_scalar(&mut self, name: &str, value: f64, step: usize) -> Result<()> {
        self.sinks
            .iter_mut()
            .try_for_each(|s| s.add_scalar(name, value, step))
    }

    fn add_text(&mut self, name: &str, text: &str) -> Result<()> {
        self.sinks.iter_mut().try_for_each(|s| s.add_text(name, text))
    }

    fn add_graph(&mut self, structure: &str) -> Result<()> {
        self.sinks.iter_mut().try_for_each(|s| s.add_graph(structure))
    }

    fn log_validation(&mut self, report: &ValidationReport, epoch: usize) -> Result<()> {
        self.sinks
            .iter_mut()
            .try_for_each(|s| s.log_validation(report, epoch))
    }

    fn flush(&mut self) -> Result<()> {
        self.sinks.iter_mut().try_for_each(|s| s.flush())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_memory_logger_scalars() {
        let mut logger = MemoryLogger::new();
        logger.add_scalar("train/batch_loss", 1.5, 0).unwrap();
        logger.add_scalar("train/t_batch", 0.1, 0).unwrap();
        logger.add_scalar("train/batch_loss", 1.0, 10).unwrap();
        assert_eq!(
            logger.scalars("train/batch_loss"),
            vec![(0, 1.5), (10, 1.0)]
        );
    }

    #[test]
    fn test_jsonl_logger_appends_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("runs").join("scalars.jsonl");
        {
            let mut logger = JsonlLogger::create(&path).unwrap();
            logger.add_scalar("learning/learning_rate", 1e-4, 0).unwrap();
            logger.add_text("comment", "baseline").unwrap();
            logger.flush().unwrap();
        }

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["type"], "scalar");
        assert_eq!(lines[0]["name"], "learning/learning_rate");
        assert_eq!(lines[1]["sequence"], 1);
        assert_eq!(lines[0]["run_id"], lines[1]["run_id"]);
    }

    fn report() -> ValidationReport {
        use emitfit_core::DetectionRecord;
        use ndarray::Array4;

        let empty = || Array4::<f32>::zeros((0, 1, 1, 1));
        ValidationReport {
            metric: 0.5,
            per_head_loss: vec![0.5],
            samples: 2,
            batches: 1,
            input: empty(),
            output: empty(),
            target: empty(),
            weight: empty(),
            predictions: DetectionSet::new(
                vec![DetectionRecord::new(1, [2.0, 3.0, 10.0], 900.0, 0.8)],
                3,
            )
            .with_samples(2),
            ground_truth: DetectionSet::new(
                vec![
                    DetectionRecord::new(0, [1.0, 1.0, 0.0], 1000.0, 1.0),
                    DetectionRecord::new(1, [2.0, 3.5, 0.0], 1200.0, 1.0),
                ],
                3,
            )
            .with_samples(2),
            matching: MatchStats::default(),
            elapsed: std::time::Duration::from_millis(3),
        }
    }

    #[test]
    fn test_jsonl_validation_carries_detections() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("scalars.jsonl");
        let report = report();
        {
            let mut logger = JsonlLogger::create(&path).unwrap();
            logger.log_validation(&report, 7).unwrap();
        }

        let content = std::fs::read_to_string(&path).unwrap();
        let line: serde_json::Value = serde_json::from_str(content.trim_end()).unwrap();
        assert_eq!(line["type"], "validation");
        assert_eq!(line["epoch"], 7);

        let summary: ValidationSummary =
            serde_json::from_value(line["summary"].clone()).unwrap();
        assert_eq!(summary.predictions, report.predictions);
        assert_eq!(summary.ground_truth, report.ground_truth);
        assert_eq!(summary.ground_truth.frames(), vec![0, 1]);
    }

    #[test]
    fn test_multi_logger_fans_out() {
        struct Shared(std::sync::Arc<std::sync::Mutex<MemoryLogger>>);

        impl TrainLogger for Shared {
            fn add_scalar(&mut self, name: &str, value: f64, step: usize) -> Result<()> {
                self.0.lock().unwrap().add_scalar(name, value, step)
            }
            fn add_text(&mut self, name: &str, text: &str) -> Result<()> {
                self.0.lock().unwrap().add_text(name, text)
            }
            fn add_graph(&mut self, structure: &str) -> Result<()> {
                self.0.lock().unwrap().add_graph(structure)
            }
            fn log_validation(&mut self, report: &ValidationReport, epoch: usize) -> Result<()> {
                self.0.lock().unwrap().log_validation(report, epoch)
            }
        }

        let a = std::sync::Arc::new(std::sync::Mutex::new(MemoryLogger::new()));
        let b = std::sync::Arc::new(std::sync::Mutex::new(MemoryLogger::new()));
        let mut multi = MultiLogger::new()
            .with(Shared(a.clone()))
            .with(Shared(b.clone()))
            .with(TracingLogger);
        assert_eq!(multi.len(), 3);

        multi.add_graph("PixelNet").unwrap();
        multi.add_scalar("x", 1.0, 3).unwrap();
        for sink in [&a, &b] {
            let sink = sink.lock().unwrap();
            assert_eq!(sink.graphs(), 1);
            assert_eq!(sink.scalars("x"), vec![(3, 1.0)]);
        }
    }
}
