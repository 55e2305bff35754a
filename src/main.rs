use nimbus::cli::commands::{CliArgs, Commands};
use nimbus::cli::handlers::{handle_build, handle_config, handle_discover, handle_images};
use nimbus::util::logging::{self, LoggingConfig};
use nimbus::VERSION;

use clap::Parser;
use std::env;
use tracing::{debug, Level};

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();
    init_logging_from_args(&args);

    debug!("nimbus v{} starting", VERSION);
    debug!("Arguments: {:?}", args);

    let exit_code = match &args.command {
        Commands::Discover(discover_args) => handle_discover(discover_args, args.quiet).await,
        Commands::Build(build_args) => handle_build(build_args).await,
        Commands::Images(images_args) => handle_images(images_args).await,
        Commands::Config(config_args) => handle_config(config_args),
    };

    std::process::exit(exit_code);
}

fn init_logging_from_args(args: &CliArgs) {
    let level = if let Some(level_str) = &args.log_level {
        logging::parse_level(level_str)
    } else if args.verbose {
        Level::DEBUG
    } else if args.quiet {
        Level::ERROR
    } else {
        let level_str = env::var("NIMBUS_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        logging::parse_level(&level_str)
    };

    let use_json = env::var("NIMBUS_LOG_JSON")
        .ok()
        .and_then(|v| v.parse::<bool>().ok())
        .unwrap_or(false);

    logging::init_logging(LoggingConfig {
        level,
        use_json,
        ..Default::default()
    });
}
