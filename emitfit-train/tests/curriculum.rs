//! Curriculum scheduling through the full trainer.

use emitfit_core::TrainConfig;
use emitfit_core::config::PlateauParams;
use emitfit_train::data::{OnlineDataset, SampleSource};
use emitfit_train::{
    Adam, DataRegime, GaussianSimulator, MemoryLogger, PixelNet, Simulator, ThresholdPostProcessor,
    Trainer, TrainerParts, WeightedMse,
};
use tempfile::TempDir;

fn config(dir: &TempDir, difficulty: f64) -> TrainConfig {
    let mut config = TrainConfig::default();
    config.io.model_out = dir.path().join("model.json");
    config.hyper.channels = 1;
    config.hyper.batch_size = 4;
    config.hyper.test_size = 4;
    config.hyper.data_lifetime = 3;
    config.hyper.min_photons = 0.0;
    config.hyper.arch.hidden_features = 4;
    // A zero learning rate keeps the validation loss identical every epoch.
    config.hyper.lr = 0.0;
    config.simulation.pseudo_data_size = 12;
    config.simulation.img_size = (8, 8);
    config.simulation.emitter_extent = [(-0.5, 7.5), (-0.5, 7.5), (-500.0, 500.0)];
    config.simulation.emitter_av = difficulty;
    config.logger.progress = false;
    config.scheduler.lr.plateau.disabled = true;
    config.scheduler.sim.step_size = 1.0;
    config.scheduler.sim.max_value = 10.0;
    config.scheduler.sim.plateau = PlateauParams {
        patience: 1,
        threshold: 0.0,
        cooldown: 0,
        disabled: false,
        ..PlateauParams::default()
    };
    config
}

fn trainer(config: &TrainConfig) -> Trainer<GaussianSimulator> {
    let hyper = &config.hyper;
    let train_sim = GaussianSimulator::new(&config.simulation, hyper, 1).unwrap();
    let test_sim = GaussianSimulator::new(&config.simulation, hyper, 2).unwrap();
    let post = ThresholdPostProcessor::new(
        &hyper.post_processing,
        hyper.dimensions,
        train_sim.photon_scale(),
        train_sim.z_scale(),
    );
    Trainer::new(
        config,
        TrainerParts {
            network: Box::new(PixelNet::from_config(hyper).unwrap()),
            optimizer: Box::new(Adam::new(hyper.lr)),
            loss: Box::new(WeightedMse),
            post_processor: Box::new(post),
            logger: Box::new(MemoryLogger::new()),
            data: DataRegime::Online {
                train: OnlineDataset::renewing(train_sim, 8, hyper.data_lifetime),
                test: OnlineDataset::fixed(test_sim, hyper.test_size),
            },
        },
    )
}

type Online = OnlineDataset<GaussianSimulator>;

fn online(trainer: &Trainer<GaussianSimulator>) -> (&Online, &Online) {
    match trainer.data() {
        DataRegime::Online { train, test } => (train, test),
        DataRegime::Precomputed { .. } => panic!("expected online data"),
    }
}

#[test]
fn test_plateau_raises_difficulty_and_expires_every_sample() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir, 5.0);
    let mut trainer = trainer(&config);

    let first = trainer.run_epoch().unwrap();
    assert!(!first.difficulty_raised);
    assert_eq!(trainer.state().difficulty, 5.0);
    let (train, test) = online(&trainer);
    assert!((0..test.len()).all(|i| !test.needs_regeneration(i)));
    assert!((0..train.len()).all(|i| !train.needs_regeneration(i)));

    let second = trainer.run_epoch().unwrap();
    assert_eq!(second.val_loss, first.val_loss);
    assert!(second.difficulty_raised);
    assert_eq!(second.difficulty, 6.0);
    assert_eq!(trainer.state().difficulty, 6.0);

    let (train, test) = online(&trainer);
    assert_eq!(train.simulator().difficulty(), 6.0);
    assert_eq!(test.simulator().difficulty(), 6.0);
    for i in 0..train.len() {
        assert!(train.needs_regeneration(i));
        assert!(train.lifecycle().is_expired(i));
    }
    for i in 0..test.len() {
        assert!(test.needs_regeneration(i));
        assert!(test.lifecycle().is_expired(i));
    }
}

#[test]
fn test_difficulty_at_maximum_keeps_cached_samples() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir, 10.0);
    let mut trainer = trainer(&config);

    trainer.run_epoch().unwrap();
    let second = trainer.run_epoch().unwrap();
    assert!(!second.difficulty_raised);
    assert_eq!(trainer.state().difficulty, 10.0);

    let (_, test) = online(&trainer);
    assert!((0..test.len()).all(|i| !test.needs_regeneration(i)));
}

#[test]
fn test_disabled_curriculum_never_changes_difficulty() {
    let dir = TempDir::new().unwrap();
    let mut config = config(&dir, 5.0);
    config.scheduler.sim.plateau.disabled = true;
    let mut trainer = trainer(&config);

    for _ in 0..3 {
        assert!(!trainer.run_epoch().unwrap().difficulty_raised);
    }
    assert_eq!(trainer.state().difficulty, 5.0);
    assert_eq!(trainer.state().curriculum.state().best, f64::INFINITY);
}
