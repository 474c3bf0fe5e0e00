use serde::{Deserialize, Serialize};

use super::sealing::{ModelForSealing, SealingMethod};
use crate::Result;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootAsset {
    pub role: String,
    pub name: String,
    pub hashes: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootChain {
    pub model: ModelForSealing,
    #[serde(rename = "boot-modes")]
    pub boot_modes: Vec<String>,
    #[serde(rename = "asset-chain")]
    pub asset_chain: Vec<BootAsset>,
    pub kernel: String,
    #[serde(rename = "kernel-cmdlines")]
    pub kernel_cmdlines: Vec<String>,
}

/// Boot chains measured for the run and recovery systems.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootChains {
    #[serde(rename = "run-mode")]
    pub run_mode: Vec<BootChain>,
    pub recovery: Vec<BootChain>,
}

impl BootChains {
    pub fn is_empty(&self) -> bool {
        self.run_mode.is_empty() && self.recovery.is_empty()
    }
}

pub trait BootEnvironment: Send + Sync {
    /// Boot chains for the current system. Legacy systems without a mode
    /// environment yield empty chains instead of an error.
    fn boot_chains(&self, method: SealingMethod) -> Result<BootChains>;
}
