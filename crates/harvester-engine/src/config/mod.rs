pub mod parser;
pub mod types;
pub mod validator;

pub use parser::{parse_config, parse_config_str};
pub use types::{EngineConfig, EngineSettings, StateConfig};
pub use validator::validate_config;
