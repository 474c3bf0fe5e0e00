pub mod config;
pub mod conflicts;
pub mod error;
pub mod external_fsm;
pub mod fdestate;
pub mod handlers;
pub mod interfaces;
pub mod keymgmt;
pub mod keyslots;
pub mod logging;
pub mod manager;
pub mod recovery_keys;
pub mod repair;
pub mod runtime_paths;
pub mod secureboot;
pub mod state;

pub type Result<T> = std::result::Result<T, error::FdeError>;

pub use error::FdeError;
pub use keyslots::{KeyslotRef, KeyslotType};
pub use manager::FdeManager;
pub use state::State;
