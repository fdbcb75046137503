use anyhow::Result;
use clap::{Parser, Subcommand};
use std::process::Command;

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Developer tasks for brewlink", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the workspace
    Build {
        /// Build with optimizations
        #[arg(long)]
        release: bool,
    },
    /// Run the core library tests
    Test,
    /// Run the brewlink CLI, passing the remaining arguments through
    Run {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

fn cargo(args: &[&str], what: &str) -> Result<()> {
    let status = Command::new(env!("CARGO")).args(args).status()?;
    if !status.success() {
        anyhow::bail!("{} failed", what);
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Build { release } => {
            println!("Building workspace...");
            let mut args = vec!["build", "--workspace"];
            if *release {
                args.push("--release");
            }
            cargo(&args, "Build")?;
        }
        Commands::Test => {
            println!("Testing brewlink-core...");
            cargo(&["test", "-p", "brewlink-core"], "Tests")?;
        }
        Commands::Run { args } => {
            let mut cargo_args = vec!["run", "-p", "brewlink-cli", "--"];
            cargo_args.extend(args.iter().map(String::as_str));
            cargo(&cargo_args, "Run")?;
        }
    }

    Ok(())
}
