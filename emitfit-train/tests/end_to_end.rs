//! Full runs built from configuration.

use std::fs;
use std::path::Path;

use emitfit_core::config::HyperParams;
use emitfit_core::{DataMode, TrainConfig};
use emitfit_train::training::ModelCheckpoint;
use emitfit_train::{GaussianSimulator, Network, PixelNet, PrecomputedDataset, Trainer};
use pretty_assertions::assert_eq;
use serde_json::Value;
use tempfile::TempDir;

fn small_config(dir: &Path) -> TrainConfig {
    let mut config = TrainConfig::default();
    config.io.model_out = dir.join("network").join("model.json");
    config.hyper.channels = 1;
    config.hyper.batch_size = 4;
    config.hyper.test_size = 4;
    config.hyper.num_epochs = 2;
    config.hyper.lr = 1e-3;
    config.hyper.data_lifetime = 1;
    config.hyper.min_photons = 0.0;
    config.hyper.grad_rescale = true;
    config.hyper.arch.hidden_features = 4;
    config.simulation.pseudo_data_size = 12;
    config.simulation.img_size = (8, 8);
    config.simulation.emitter_extent = [(-0.5, 7.5), (-0.5, 7.5), (-500.0, 500.0)];
    config.simulation.emitter_av = 3.0;
    config.logger.progress = false;
    config.logger.comment = "smoke".into();
    config.logger.scalars_file = Some(dir.join("scalars.jsonl"));
    config
}

fn events(path: &Path) -> Vec<Value> {
    fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

fn scalar_steps(events: &[Value], name: &str) -> Vec<u64> {
    events
        .iter()
        .filter(|e| e["type"] == "scalar" && e["name"] == name)
        .map(|e| e["step"].as_u64().unwrap())
        .collect()
}

#[test]
fn test_online_run_writes_checkpoint_and_scalars() {
    let dir = TempDir::new().unwrap();
    let config = small_config(dir.path());

    let mut trainer = Trainer::from_config(&config).unwrap();
    let metrics = trainer.run().unwrap().clone();
    assert_eq!(metrics.epochs_completed(), 2);
    assert!(metrics.best_epoch.is_some());
    assert!(metrics.epochs.iter().all(|e| e.val_loss.is_finite()));
    assert_eq!(trainer.state().epoch, 2);
    // 8 training samples in batches of 4
    assert_eq!(trainer.state().global_step, 4);
    let checkpoint = trainer.checkpoint().current_path();
    drop(trainer);

    assert!(checkpoint.ends_with("model_0.json"));
    let mut restored = PixelNet::from_config(&config.hyper).unwrap();
    let file = ModelCheckpoint::load(Some(checkpoint.as_path()), &mut restored)
        .unwrap()
        .unwrap();
    assert_eq!(file.epoch, 1);

    let events = events(&dir.path().join("scalars.jsonl"));
    assert_eq!(scalar_steps(&events, "learning/learning_rate"), vec![0, 1]);
    assert_eq!(scalar_steps(&events, "learning/difficulty"), vec![0, 1]);
    assert_eq!(scalar_steps(&events, "train/batch_loss"), vec![0, 2]);
    assert_eq!(events.iter().filter(|e| e["type"] == "validation").count(), 2);
    assert_eq!(events.iter().filter(|e| e["type"] == "graph").count(), 1);
    assert!(
        events
            .iter()
            .any(|e| e["type"] == "text" && e["text"] == "smoke")
    );
    assert!(
        events
            .iter()
            .any(|e| e["type"] == "text" && e["name"] == "config/scheduler")
    );
}

#[test]
fn test_precomputed_run_keeps_difficulty() {
    let dir = TempDir::new().unwrap();
    let mut config = small_config(dir.path());
    let data_path = dir.path().join("frames.json");

    let hyper = HyperParams {
        seed: 9,
        ..config.hyper.clone()
    };
    let mut simulator = GaussianSimulator::new(&config.simulation, &hyper, hyper.seed).unwrap();
    PrecomputedDataset::generate(&mut simulator, 10)
        .unwrap()
        .save(&data_path)
        .unwrap();

    config.io.data_mode = DataMode::Precomputed;
    config.io.data_set = Some(data_path);
    config.hyper.num_epochs = 1;
    config.scheduler.sim.plateau.disabled = false;

    let mut trainer = Trainer::from_config(&config).unwrap();
    trainer.run().unwrap();
    assert!(trainer.data().difficulty().is_none());
    assert_eq!(trainer.state().difficulty, config.simulation.emitter_av);
    // 6 training samples in batches of 4
    assert_eq!(trainer.state().global_step, 2);
}

#[test]
fn test_warm_start_from_checkpoint() {
    let dir = TempDir::new().unwrap();
    let mut config = small_config(dir.path());
    config.hyper.num_epochs = 1;

    let mut first = Trainer::from_config(&config).unwrap();
    first.run().unwrap();
    let path = first.checkpoint().current_path();
    drop(first);

    config.io.model_init = Some(path.clone());
    let second = Trainer::from_config(&config).unwrap();
    let saved = second.network().state_dict();
    let mut reference = PixelNet::from_config(&config.hyper).unwrap();
    ModelCheckpoint::load(Some(path.as_path()), &mut reference).unwrap();
    assert_eq!(saved, reference.state_dict());
    // a second run in the same place writes a new file instead of overwriting
    assert!(second.checkpoint().current_path().ends_with("model_1.json"));
}

#[test]
fn test_missing_dataset_file_fails() {
    let dir = TempDir::new().unwrap();
    let mut config = small_config(dir.path());
    config.io.data_mode = DataMode::Precomputed;
    config.io.data_set = Some(dir.path().join("absent.json"));
    assert!(Trainer::from_config(&config).is_err());
}
