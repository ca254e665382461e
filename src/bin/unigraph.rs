use std::error::Error;
use std::io;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;
use unigraph::{Evaluator, GlobalConfig, GraphAssembler, UniModel};

#[derive(Parser)]
#[command(name = "unigraph", version, about = "Convert uni-models into native graphs")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build the native graph for a uni-model and save it
    Convert {
        /// Uni-model JSON
        #[arg(short, long, value_name = "PATH")]
        model: PathBuf,
        /// Global configuration JSON
        #[arg(short, long, value_name = "PATH")]
        config: PathBuf,
        /// Evaluate the converted graph on the configured dataset
        #[arg(long)]
        eval: bool,
    },
}

fn install_logger() -> Result<(), tracing::subscriber::SetGlobalDefaultError> {
    let subscriber = tracing_subscriber::fmt().compact().finish();
    tracing::subscriber::set_global_default(subscriber)
}

fn main() -> Result<(), Box<dyn Error>> {
    install_logger()?;
    let args = Cli::parse();

    match args.command {
        Command::Convert {
            model,
            config,
            eval,
        } => {
            let uni_model = UniModel::from_path(&model)?;
            let config = GlobalConfig::from_path(&config)?;
            info!(layers = uni_model.sorted_layers.len(), "loaded uni-model");

            let assembler = GraphAssembler::from_model(&uni_model, &config)?;
            if config.model_solver.cntk_model_path.is_some() {
                assembler.export_model()?;
            }

            if eval {
                let graph = assembler
                    .into_model()
                    .ok_or("conversion produced no graph")?;
                let evaluator = Evaluator::new(&config, graph);
                evaluator.eval_model(&mut io::stdout())?;
            }
        }
    }
    Ok(())
}
