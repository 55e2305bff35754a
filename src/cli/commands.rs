use crate::config::Provider;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Code-as-config discovery for serverless projects
#[derive(Parser, Debug)]
#[command(
    name = "nimbus",
    about = "Code-as-config discovery and image pipeline for serverless projects",
    version,
    author,
    long_about = "nimbus runs every function handler of a project in an ephemeral container, \
                  records the resources and triggers the handler declares at startup, and \
                  merges them into one dependency graph. It also builds the deployable \
                  images for a target provider."
)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, global = true, value_name = "LEVEL", help = "Set logging level")]
    pub log_level: Option<String>,

    #[arg(short = 'v', long, global = true, help = "Enable debug logging")]
    pub verbose: bool,

    #[arg(
        short = 'q',
        long,
        global = true,
        conflicts_with = "verbose",
        help = "Quiet mode - suppress non-error output"
    )]
    pub quiet: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[command(
        about = "Discover the resources and triggers of every function",
        long_about = "Builds and runs each function handler against a local capture server \
                      and prints the merged dependency graph. Exits with status 1 if any \
                      function fails discovery, unless --allow-partial is given.\n\n\
                      Examples:\n  \
                      nimbus discover\n  \
                      nimbus discover ./shop --format json\n  \
                      nimbus discover --timeout 300 --allow-partial"
    )]
    Discover(DiscoverArgs),

    #[command(
        about = "Build deployable images",
        long_about = "Builds the deployable image of every function and container for the \
                      target provider.\n\n\
                      Examples:\n  \
                      nimbus build\n  \
                      nimbus build ./shop --provider gcp"
    )]
    Build(BuildArgs),

    #[command(about = "List the images built for a project")]
    Images(ImagesArgs),

    #[command(about = "Show the effective configuration")]
    Config(ConfigArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct DiscoverArgs {
    #[arg(value_name = "PATH", help = "Project directory (defaults to current directory)")]
    pub path: Option<PathBuf>,

    #[arg(
        short = 'f',
        long,
        value_enum,
        help = "Output format (human on a terminal, json otherwise)"
    )]
    pub format: Option<OutputFormatArg>,

    #[arg(short = 'p', long, value_parser = parse_provider, help = "Target provider")]
    pub provider: Option<Provider>,

    #[arg(
        long,
        value_name = "SECONDS",
        help = "Time a function may take to finish discovery"
    )]
    pub timeout: Option<u64>,

    #[arg(short = 'j', long, value_name = "N", help = "Functions discovered concurrently")]
    pub max_parallel: Option<usize>,

    #[arg(
        long,
        value_name = "HOST",
        help = "Host name containers use to reach the capture server"
    )]
    pub advertise_host: Option<String>,

    #[arg(long, help = "Print the partial graph and exit 0 when some functions fail")]
    pub allow_partial: bool,

    #[arg(
        short = 'o',
        long,
        value_name = "FILE",
        help = "Write output to file instead of stdout"
    )]
    pub output: Option<PathBuf>,
}

#[derive(Parser, Debug, Clone)]
pub struct BuildArgs {
    #[arg(value_name = "PATH", help = "Project directory (defaults to current directory)")]
    pub path: Option<PathBuf>,

    #[arg(short = 'f', long, value_enum, help = "Output format")]
    pub format: Option<OutputFormatArg>,

    #[arg(short = 'p', long, value_parser = parse_provider, help = "Target provider")]
    pub provider: Option<Provider>,

    #[arg(long, value_name = "SECONDS", help = "Time an image build may take")]
    pub build_timeout: Option<u64>,

    #[arg(short = 'j', long, value_name = "N", help = "Images built concurrently")]
    pub max_parallel: Option<usize>,
}

#[derive(Parser, Debug, Clone)]
pub struct ImagesArgs {
    #[arg(value_name = "PATH", help = "Project directory (defaults to current directory)")]
    pub path: Option<PathBuf>,

    #[arg(short = 'f', long, value_enum, help = "Output format")]
    pub format: Option<OutputFormatArg>,
}

#[derive(Parser, Debug, Clone)]
pub struct ConfigArgs {
    #[arg(short = 'f', long, value_enum, help = "Output format")]
    pub format: Option<OutputFormatArg>,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormatArg {
    Json,
    Yaml,
    Human,
}

impl From<OutputFormatArg> for super::output::OutputFormat {
    fn from(arg: OutputFormatArg) -> Self {
        match arg {
            OutputFormatArg::Json => super::output::OutputFormat::Json,
            OutputFormatArg::Yaml => super::output::OutputFormat::Yaml,
            OutputFormatArg::Human => super::output::OutputFormat::Human,
        }
    }
}

fn parse_provider(s: &str) -> Result<Provider, String> {
    s.parse::<Provider>().map_err(|e| e.to_string())
}
