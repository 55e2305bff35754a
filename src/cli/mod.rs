pub mod commands;
pub mod handlers;
pub mod output;

pub use commands::{BuildArgs, CliArgs, Commands, ConfigArgs, DiscoverArgs, ImagesArgs};
pub use output::{DiscoveryReport, OutputFormat, OutputFormatter};
