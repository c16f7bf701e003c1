//! Atomic JSON files for checkpoints and precomputed datasets.
//!
//! Writes go to a `.tmp` sibling which is then renamed over the target, so a
//! crash mid-write never leaves a truncated checkpoint behind.

use std::io;
use std::path::Path;

/// Serializes `data` as JSON and writes it atomically, creating parent
/// directories as needed.
pub fn atomic_write_json<T: serde::Serialize>(path: &Path, data: &T) -> io::Result<()> {
    let json = serde_json::to_vec(data).map_err(io::Error::other)?;
    atomic_write(path, &json)
}

pub fn atomic_write(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Reads and deserializes a JSON file. `Ok(None)` when it does not exist.
pub fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> io::Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let data = std::fs::read(path)?;
    let value =
        serde_json::from_slice(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_round_trip_creates_parents_without_leftovers() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("network").join("model.json");

        atomic_write_json(&path, &vec![1.5f32, -2.0]).unwrap();
        assert!(!path.with_extension("tmp").exists());
        let loaded: Option<Vec<f32>> = load_json(&path).unwrap();
        assert_eq!(loaded, Some(vec![1.5, -2.0]));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = TempDir::new().unwrap();
        let loaded: Option<Vec<f32>> = load_json(&dir.path().join("absent.json")).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_load_invalid_json() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.json");
        atomic_write(&path, b"{ not json").unwrap();
        let err = load_json::<Vec<f32>>(&path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
