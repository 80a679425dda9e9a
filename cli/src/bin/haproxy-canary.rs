use anyhow::Result;
use clap::Parser;
use haproxy_canary_cli::{check, status};
use haproxy_canary_controller::marathon;
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
/// Inspects the HAProxy configuration the canary controller derives from Marathon.
struct Cli {
    #[arg(long, default_value = "warn")]
    log_level: kubert::LogFilter,

    /// Marathon endpoints, tried in order
    #[arg(
        long,
        env = "MARATHON_ENDPOINTS",
        value_delimiter = ',',
        required = true,
        global = true
    )]
    marathon_endpoints: Vec<String>,

    #[arg(long, env = "MARATHON_USER", global = true)]
    marathon_user: Option<String>,

    #[arg(long, env = "MARATHON_PASSWORD", hide_env_values = true, global = true)]
    marathon_password: Option<String>,

    /// JSON array of weight records to apply instead of the canary defaults
    #[arg(long, env = "HAPROXY_CANARY_WEIGHTS_FILE", global = true)]
    weights_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::ValueEnum, Clone)]
enum OutputMode {
    Table,
    Json,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Check the controller's environment for potential problems
    Check {
        #[arg(long, env = "HAPROXY_TEMPLATE_PATH", default_value = "haproxy_template.cfg")]
        template_path: PathBuf,

        #[arg(long, env = "HAPROXY_OUTPUT_PATH", default_value = "/etc/haproxy/haproxy.cfg")]
        output_path: PathBuf,

        /// Output format
        #[arg(short, long, default_value = "table")]
        output: OutputMode,
    },

    /// Show every frontend's servers and their weights
    Status {
        /// Output format
        #[arg(short, long, default_value = "table")]
        output: OutputMode,
    },

    /// Print the configuration the controller would write
    Render {
        #[arg(long, env = "HAPROXY_TEMPLATE_PATH", default_value = "haproxy_template.cfg")]
        template_path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let Cli {
        log_level,
        marathon_endpoints,
        marathon_user,
        marathon_password,
        weights_file,
        command,
    } = Cli::parse();

    kubert::LogFormat::Plain.try_init(log_level)?;

    let marathon =
        marathon::Client::new(marathon_endpoints).with_credentials(marathon_user, marathon_password);
    let weights = haproxy_canary_cli::load_weights(weights_file.as_deref()).await?;

    match command {
        Commands::Check {
            template_path,
            output_path,
            output,
        } => {
            let target = check::Target {
                marathon: &marathon,
                template_path: &template_path,
                output_path: &output_path,
                weights: &weights,
            };
            let results = check::run_checks(&target).await;
            let success = match output {
                OutputMode::Table => check::print_checks(&results),
                OutputMode::Json => check::json_print_checks(&results)?,
            };

            if !success {
                std::process::exit(1);
            }
        }

        Commands::Status { output } => {
            let model = haproxy_canary_cli::model(&marathon, &weights).await?;
            let results = status::status(&model);
            match output {
                OutputMode::Table => status::print_status(&results),
                OutputMode::Json => status::json_print_status(&results)?,
            }
        }

        Commands::Render { template_path } => {
            let model = haproxy_canary_cli::model(&marathon, &weights).await?;
            print!("{}", haproxy_canary_cli::render(&template_path, &model).await?);
        }
    }

    Ok(())
}
