use clap::Parser;
use cpu_gate::core::hardware::HostCpu;
use cpu_gate::core::runtime;
use cpu_gate::cpuid::source::RecordedCpuid;
use cpu_gate::cpuid::{self, Snapshot};
use cpu_gate::FeatureVector;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, about = "Dump raw cpuid leaves, classification and derived features as JSON", long_about = None)]
struct Args {
    /// Derive from a previous dump, a bare snapshot or a recorded leaf list instead of the host
    #[arg(short, long, conflicts_with = "all_cores")]
    replay: Option<PathBuf>,

    /// Detect on every core separately, each on a pinned thread
    #[arg(long)]
    all_cores: bool,

    /// Write JSON here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
}

/// A full dump from this tool, a bare snapshot, or raw recorded leaves.
#[derive(Deserialize)]
#[serde(untagged)]
enum ReplayInput {
    Dump { snapshot: Snapshot },
    Bare(Snapshot),
    Recorded(RecordedCpuid),
}

#[derive(Serialize)]
struct CoreExport {
    /// OS core ID the detection thread was pinned to.
    core_id: usize,
    cpu: HostCpu,
}

#[derive(Serialize)]
struct AllCoresExport {
    common: FeatureVector,
    cores: Vec<CoreExport>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    let args = Args::parse();

    let json = if let Some(path) = &args.replay {
        eprintln!("Replaying snapshot from {:?}", path);
        let file = File::open(path)?;
        let snapshot = match serde_json::from_reader(file)? {
            ReplayInput::Dump { snapshot } | ReplayInput::Bare(snapshot) => snapshot,
            ReplayInput::Recorded(recorded) => cpuid::capture_from(&recorded),
        };
        serde_json::to_string_pretty(&HostCpu::from_snapshot(snapshot))?
    } else if args.all_cores {
        let cores = runtime::capture_all_cores();
        if cores.is_empty() {
            eprintln!("Error: could not pin a thread to any core.");
            std::process::exit(1);
        }
        let common = runtime::common_features(cores.iter().map(|(_, cpu)| &cpu.features));
        let export = AllCoresExport {
            common,
            cores: cores.into_iter().map(|(core_id, cpu)| CoreExport { core_id, cpu }).collect(),
        };
        serde_json::to_string_pretty(&export)?
    } else {
        serde_json::to_string_pretty(&HostCpu::detect())?
    };

    match &args.output {
        Some(path) => {
            let mut file = File::create(path)?;
            file.write_all(json.as_bytes())?;
            eprintln!("Exported to {:?}", path);
        }
        None => println!("{}", json),
    }
    Ok(())
}
