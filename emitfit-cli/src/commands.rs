//! Subcommand handlers.

use std::path::Path;

use emitfit_core::{ConfigOverrides, DataMode, TrainConfig, load_config};
use emitfit_train::{GaussianSimulator, PrecomputedDataset, Trainer};

use crate::{Commands, ConfigAction, TrainArgs};

const DEFAULT_CONFIG_FILE: &str = "emitfit.toml";

pub(crate) fn handle_command(command: Commands, config_path: Option<&Path>) -> anyhow::Result<()> {
    match command {
        Commands::Train(args) => handle_train(&args, config_path),
        Commands::Simulate { out, samples, seed } => {
            handle_simulate(&out, samples, seed, config_path)
        }
        Commands::Config { action } => handle_config(action, config_path),
    }
}

fn path_value(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Turns command-line flags into configuration overrides. An unknown data
/// mode is rejected here, before any configuration is loaded.
fn train_overrides(args: &TrainArgs) -> anyhow::Result<ConfigOverrides> {
    let mut overrides = ConfigOverrides::new();
    if let Some(epochs) = args.epochs {
        overrides = overrides.set("hyper.num_epochs", epochs);
    }
    if let Some(lr) = args.lr {
        overrides = overrides.set("hyper.lr", lr);
    }
    if let Some(batch_size) = args.batch_size {
        overrides = overrides.set("hyper.batch_size", batch_size);
    }
    if let Some(mode) = &args.data_mode {
        let mode: DataMode = mode.parse()?;
        overrides = overrides.set("io.data_mode", mode.to_string());
    }
    if let Some(path) = &args.data_set {
        overrides = overrides.set("io.data_set", path_value(path));
    }
    if let Some(path) = &args.model_out {
        overrides = overrides.set("io.model_out", path_value(path));
    }
    if let Some(path) = &args.model_init {
        overrides = overrides.set("io.model_init", path_value(path));
    }
    if let Some(path) = &args.scalars {
        overrides = overrides.set("logger.scalars_file", path_value(path));
    }
    if args.no_progress {
        overrides = overrides.set("logger.progress", false);
    }
    Ok(overrides)
}

fn load_validated(
    config_path: Option<&Path>,
    overrides: &ConfigOverrides,
) -> anyhow::Result<TrainConfig> {
    let config = load_config(config_path, overrides)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    config.validate()?;
    Ok(config)
}

fn handle_train(args: &TrainArgs, config_path: Option<&Path>) -> anyhow::Result<()> {
    let config = load_validated(config_path, &train_overrides(args)?)?;
    tracing::debug!(
        data_mode = %config.io.data_mode,
        epochs = config.hyper.num_epochs,
        "configuration resolved"
    );
    let mut trainer = Trainer::from_config(&config)?;
    trainer.run()?;
    let metrics = trainer.metrics();

    match (metrics.best_epoch, metrics.best_val_loss) {
        (Some(epoch), Some(loss)) => {
            println!("Best validation loss {loss:.5} at epoch {epoch}")
        }
        _ => println!("No finite validation loss was recorded"),
    }
    println!(
        "Finished {} epochs in {:.1}s; checkpoint: {}",
        metrics.epochs_completed(),
        metrics.total_training_time_secs,
        trainer.checkpoint().current_path().display()
    );
    Ok(())
}

fn handle_simulate(
    out: &Path,
    samples: Option<usize>,
    seed: Option<u64>,
    config_path: Option<&Path>,
) -> anyhow::Result<()> {
    let config = load_validated(config_path, &ConfigOverrides::new())?;
    let samples = samples.unwrap_or(config.simulation.pseudo_data_size);
    let seed = seed.unwrap_or(config.hyper.seed);
    tracing::info!(samples, seed, out = %out.display(), "simulating dataset");

    let mut simulator = GaussianSimulator::new(&config.simulation, &config.hyper, seed)?;
    let dataset = PrecomputedDataset::generate(&mut simulator, samples)?;
    dataset.save(out)?;
    println!("Wrote {samples} samples to {}", out.display());
    Ok(())
}

fn handle_config(action: ConfigAction, config_path: Option<&Path>) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let path = config_path.unwrap_or(Path::new(DEFAULT_CONFIG_FILE));
            if path.exists() {
                println!("Configuration file already exists at: {}", path.display());
                return Ok(());
            }
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, TrainConfig::default().to_toml_string()?)?;
            println!("Created configuration file at: {}", path.display());
            Ok(())
        }
        ConfigAction::Show => {
            let config = load_config(config_path, &ConfigOverrides::new())
                .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;
            println!("{}", config.to_toml_string()?);
            Ok(())
        }
        ConfigAction::Validate => {
            let config = load_validated(config_path, &ConfigOverrides::new())?;
            println!(
                "Configuration is valid (data mode: {}, {} epochs)",
                config.io.data_mode, config.hyper.num_epochs
            );
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use emitfit_train::SampleSource;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;
    use tempfile::TempDir;

    const SMALL: &str = r#"
[hyper]
channels = 1
batch_size = 2
test_size = 2
num_epochs = 1
min_photons = 0.0

[hyper.arch]
hidden_features = 4

[simulation]
pseudo_data_size = 6
img_size = [8, 8]
emitter_extent = [[-0.5, 7.5], [-0.5, 7.5], [-500.0, 500.0]]
emitter_av = 2.0

[logger]
progress = false
"#;

    fn small_config(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("emitfit.toml");
        std::fs::write(&path, SMALL).unwrap();
        path
    }

    #[test]
    fn test_config_init_creates_valid_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("conf").join("emitfit.toml");
        handle_config(ConfigAction::Init, Some(path.as_path())).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let parsed: TrainConfig = toml::from_str(&content).unwrap();
        assert_eq!(parsed, TrainConfig::default());
    }

    #[test]
    fn test_config_init_does_not_overwrite() {
        let dir = TempDir::new().unwrap();
        let path = small_config(&dir);
        handle_config(ConfigAction::Init, Some(path.as_path())).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), SMALL);
    }

    #[test]
    fn test_config_show_and_validate() {
        let dir = TempDir::new().unwrap();
        let path = small_config(&dir);
        assert!(handle_config(ConfigAction::Show, Some(path.as_path())).is_ok());
        assert!(handle_config(ConfigAction::Validate, Some(path.as_path())).is_ok());
    }

    #[test]
    fn test_validate_rejects_precomputed_without_dataset() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[io]\ndata_mode = \"precomputed\"\n").unwrap();
        assert!(handle_config(ConfigAction::Validate, Some(path.as_path())).is_err());
    }

    #[test]
    fn test_train_overrides() {
        let args = TrainArgs {
            epochs: Some(3),
            lr: Some(0.01),
            data_mode: Some("precomputed".into()),
            data_set: Some(PathBuf::from("frames.json")),
            no_progress: true,
            ..TrainArgs::default()
        };
        let dir = TempDir::new().unwrap();
        let path = small_config(&dir);
        let overrides = train_overrides(&args).unwrap();
        let config = load_config(Some(path.as_path()), &overrides).unwrap();
        assert_eq!(config.hyper.num_epochs, 3);
        assert_eq!(config.hyper.lr, 0.01);
        assert_eq!(config.io.data_mode, DataMode::Precomputed);
        assert_eq!(config.io.data_set, Some(PathBuf::from("frames.json")));
        assert!(!config.logger.progress);
        // untouched values come from the file
        assert_eq!(config.hyper.batch_size, 2);
    }

    #[test]
    fn test_unknown_data_mode_is_rejected() {
        let args = TrainArgs {
            data_mode: Some("streaming".into()),
            ..TrainArgs::default()
        };
        assert!(train_overrides(&args).is_err());
    }

    #[test]
    fn test_simulate_writes_dataset() {
        let dir = TempDir::new().unwrap();
        let config = small_config(&dir);
        let out = dir.path().join("data").join("frames.json");
        handle_simulate(&out, Some(3), Some(1), Some(config.as_path())).unwrap();

        let dataset = PrecomputedDataset::load(&out).unwrap();
        assert_eq!(dataset.len(), 3);
    }

    #[test]
    fn test_train_writes_checkpoint() {
        let dir = TempDir::new().unwrap();
        let config = small_config(&dir);
        let model_out = dir.path().join("model.json");
        let args = TrainArgs {
            model_out: Some(model_out),
            ..TrainArgs::default()
        };
        handle_train(&args, Some(config.as_path())).unwrap();
        assert!(dir.path().join("model_0.json").exists());
    }
}
