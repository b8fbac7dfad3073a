use serde::{Deserialize, Serialize};

use crate::{Result, StorageError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    pub max_key_size: usize,
    pub max_value_size: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_key_size: 1024,
            max_value_size: 1024 * 1024, // 1MB
        }
    }
}

pub fn validate_key(key: &[u8], limits: &Limits) -> Result<()> {
    if key.is_empty() {
        return Err(StorageError::InvalidKey("key must not be empty".to_string()));
    }
    if key.len() > limits.max_key_size {
        return Err(StorageError::InvalidKey(format!(
            "key is {} bytes, limit is {}",
            key.len(),
            limits.max_key_size
        )));
    }
    Ok(())
}

pub fn validate_value(value: &[u8], limits: &Limits) -> Result<()> {
    if value.len() > limits.max_value_size {
        return Err(StorageError::InvalidValue(format!(
            "value is {} bytes, limit is {}",
            value.len(),
            limits.max_value_size
        )));
    }
    Ok(())
}
