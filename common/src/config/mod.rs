mod file;

pub use file::{load_config, PipelineConfig, ShuttleConfig, ToolsConfig};
