use clap::{Parser, Subcommand};
use cpu_gate::core::diagnostics::Diagnostics;
use cpu_gate::core::gate::AssumedFeatures;
use cpu_gate::storage::mask;
use cpu_gate::{capture_and_derive_features, check_compatibility_or_abort, Feature};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print this host's feature vector as JSON
    Detect {
        /// Only list the features that are present
        #[arg(long)]
        present_only: bool,
    },
    /// Write an assumed-feature mask file
    Mask {
        /// Comma-separated features the build depends on, e.g. sse4_2,popcnt,avx2
        #[arg(short, long, value_delimiter = ',')]
        require: Vec<Feature>,

        /// Require exactly what this host has
        #[arg(long, conflicts_with = "require")]
        from_host: bool,

        #[arg(short, long)]
        output: PathBuf,
    },
    /// Exit non-zero unless this host satisfies a mask file
    Check {
        #[arg(short, long)]
        mask: PathBuf,

        #[arg(long, default_value = "The current machine does not support all of the CPU features this build depends on.")]
        message: String,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match args.command {
        Command::Detect { present_only } => {
            let features = capture_and_derive_features();
            let json = if present_only {
                let present: Vec<Feature> = features.iter().collect();
                serde_json::to_string_pretty(&present)?
            } else {
                serde_json::to_string_pretty(&features)?
            };
            println!("{}", json);
        }
        Command::Mask { require, from_host, output } => {
            let assumed = if from_host {
                AssumedFeatures::from_host(&capture_and_derive_features())
            } else {
                AssumedFeatures::requiring(&require)
            };
            mask::save(&output, &assumed)?;
            info!(path = ?output, required = assumed.required().len(), "wrote mask file");
            println!("Wrote {:?} ({} required features)", output, assumed.required().len());
        }
        Command::Check { mask: path, message } => {
            let assumed = mask::load(&path)?;
            check_compatibility_or_abort(assumed.as_bytes(), &message);

            let status = Diagnostics::check_host(&capture_and_derive_features(), &assumed);
            println!("OK: {}", Diagnostics::describe(&status));
        }
    }

    Ok(())
}
