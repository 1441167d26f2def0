use clap::{Parser, Subcommand};
use gasm_core::args::region_caller::RegionCallerArgs;
use gasm_core::processes::region_caller::region_caller_process;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reads a region file, recruits and assembles reads, and calls variants.
    Call(RegionCallerArgs),
}

fn main() {
    let args = Cli::parse();

    match args.command {
        Commands::Call(cmd_args) => region_caller_process(&cmd_args),
    }
}
