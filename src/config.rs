use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Drop rate {0} is outside [0.0, 1.0)")]
    InvalidDropRate(f64),
}

/// Receiver-side options for a [`DecodeSession`](crate::session::DecodeSession).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionOptions {
    /// Probability of discarding each frame before it reaches the decoder.
    pub drop_rate:  f64,
    /// Stop after this many frames have been handed to the decoder.
    pub max_blocks: Option<u64>,
    /// Seed for the drop RNG.  `None` seeds from the OS.
    pub seed:       Option<u64>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            drop_rate:  0.0,
            max_blocks: None,
            seed:       None,
        }
    }
}

impl SessionOptions {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..1.0).contains(&self.drop_rate) {
            return Err(ConfigError::InvalidDropRate(self.drop_rate));
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec_pretty(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ConfigError> {
        let opts: Self = serde_json::from_slice(bytes)?;
        opts.validate()?;
        Ok(opts)
    }

    /// Load options from a JSON file.  Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::from_bytes(&std::fs::read(path)?)
    }
}
