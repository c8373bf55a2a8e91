use carbonrun::config::Config;
use carbonrun::regions::BuiltinRegions;
use carbonrun::report::make_report;
use carbonrun::run::run;
use carbonrun::tdp::TdpResolver;
use carbonrun::utils::errors::CarbonError;
use carbonrun::utils::logger::setup_logger;
use carbonrun::utils::psutils::cpu_brand_string;
use clap::{Parser, Subcommand};
use log::error;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "carbonrun")]
#[command(about = "Track the energy consumption and emissions of computing workloads")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Transparently run the given command and log its consumption
    Run {
        /// Log consumption under this tag (defaults to the binary name)
        #[arg(long)]
        tag: Option<String>,

        /// Command to run, with its arguments
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        cmdline: Vec<String>,
    },
    /// Get the per-core TDP of a CPU by its brand string
    Tdp {
        /// CPU brand string (defaults to this machine's CPU)
        cpu: Option<String>,
    },
    /// Report on the aggregated consumption
    Report {
        /// Region to calculate the emission cost of electricity, or `none`
        #[arg(long)]
        region: String,

        /// CPU log to aggregate (defaults to the one in the state directory)
        #[arg(long)]
        logfile: Option<PathBuf>,

        /// Multiplier from CPU energy to whole-node energy [default: 1.17]
        #[arg(long)]
        node_factor: Option<f64>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    setup_logger();
    let cli = Cli::parse();
    let config = Config::from_env();

    match cli.command {
        Commands::Run { tag, cmdline } => match run(&config, &cmdline, tag.as_deref()).await {
            Ok(outcome) => ExitCode::from(u8::try_from(outcome.exit_code()).unwrap_or(1)),
            Err(e) => {
                error!("{}", e);
                ExitCode::from(127)
            }
        },
        Commands::Tdp { cpu } => report_result(print_tdp(&config, cpu).await),
        Commands::Report {
            region,
            logfile,
            node_factor,
        } => {
            let config = match node_factor {
                Some(factor) => config.with_node_factor(factor),
                None => config,
            };
            report_result(print_report(&config, &region, logfile).await)
        }
    }
}

fn report_result(result: Result<(), CarbonError>) -> ExitCode {
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn print_tdp(config: &Config, cpu: Option<String>) -> Result<(), CarbonError> {
    let cpu = cpu.filter(|c| !c.is_empty()).unwrap_or_else(cpu_brand_string);
    let resolver = TdpResolver::from_config(config)?;
    let info = resolver.resolve(&cpu).await?;
    let json = serde_json::to_string(&info)
        .map_err(|e| CarbonError::Other(format!("serialize TDP info: {}", e)))?;
    println!("{}", json);
    Ok(())
}

async fn print_report(
    config: &Config,
    region: &str,
    logfile: Option<PathBuf>,
) -> Result<(), CarbonError> {
    let log_path = logfile.unwrap_or_else(|| config.cpu_log_path());
    let resolver = TdpResolver::from_config(config)?;
    let report = make_report(
        &log_path,
        region,
        config.node_factor,
        &resolver,
        &BuiltinRegions,
    )
    .await?;
    println!("{}", report.to_json()?);
    Ok(())
}
