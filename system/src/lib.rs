//! Startup preflight: checks the host against the startup descriptor before
//! any node component is constructed.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum PreflightError {
    #[error("Storage directory {path}: {reason}")]
    Storage { path: PathBuf, reason: String },
    #[error("TLS {role} file {path} is missing or not a file")]
    TlsMaterial { role: &'static str, path: PathBuf },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsPaths {
    pub certfile: Option<PathBuf>,
    pub keyfile: Option<PathBuf>,
    pub cafile: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreflightConfig {
    pub storage_path: PathBuf,
    pub tls: TlsPaths,
}

pub fn preflight_check(config: &PreflightConfig) -> Result<(), PreflightError> {
    check_storage(&config.storage_path)?;
    check_tls_material(&config.tls)?;
    Ok(())
}

fn check_storage(storage_path: &Path) -> Result<(), PreflightError> {
    let failure = |reason: String| PreflightError::Storage {
        path: storage_path.to_path_buf(),
        reason,
    };

    fs::create_dir_all(storage_path).map_err(|e| failure(format!("cannot create: {}", e)))?;

    let metadata = fs::metadata(storage_path).map_err(|e| failure(format!("cannot stat: {}", e)))?;
    if !metadata.is_dir() {
        return Err(failure("not a directory".to_string()));
    }

    let marker = storage_path.join(".preflight");
    fs::write(&marker, b"ok").map_err(|e| failure(format!("not writable: {}", e)))?;
    fs::remove_file(&marker)?;

    tracing::info!(path = %storage_path.display(), "Storage check passed");
    Ok(())
}

fn check_tls_material(tls: &TlsPaths) -> Result<(), PreflightError> {
    let files = [
        ("certificate", &tls.certfile),
        ("key", &tls.keyfile),
        ("CA", &tls.cafile),
    ];
    let mut configured = 0;
    for (role, path) in files {
        let Some(path) = path else {
            continue;
        };
        configured += 1;
        if !path.is_file() {
            return Err(PreflightError::TlsMaterial {
                role,
                path: path.clone(),
            });
        }
    }

    if configured == 0 {
        tracing::warn!("No TLS material configured, peer and client traffic is unauthenticated");
    } else {
        tracing::info!(files = configured, "TLS material check passed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_missing_storage_directory() {
        let dir = tempfile::tempdir().unwrap();
        let config = PreflightConfig {
            storage_path: dir.path().join("nested/data"),
            tls: TlsPaths::default(),
        };
        preflight_check(&config).unwrap();
        assert!(config.storage_path.is_dir());
        assert!(!config.storage_path.join(".preflight").exists());
    }

    #[test]
    fn rejects_storage_path_that_is_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("occupied");
        fs::write(&file, b"x").unwrap();
        let config = PreflightConfig {
            storage_path: file,
            tls: TlsPaths::default(),
        };
        assert!(matches!(preflight_check(&config), Err(PreflightError::Storage { .. })));
    }

    #[test]
    fn missing_tls_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("node.pem");
        fs::write(&cert, b"cert").unwrap();
        let config = PreflightConfig {
            storage_path: dir.path().join("data"),
            tls: TlsPaths {
                certfile: Some(cert),
                keyfile: Some(dir.path().join("node.key")),
                cafile: None,
            },
        };
        match preflight_check(&config) {
            Err(PreflightError::TlsMaterial { role, .. }) => assert_eq!(role, "key"),
            other => panic!("unexpected result {:?}", other),
        }
    }
}
