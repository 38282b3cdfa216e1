use clap::Parser;

mod cli;

use cli::{run_command, Cli};

fn main() {
    let cli = Cli::parse();

    // Logging and the runtime are set up per command, after any fork
    if let Err(e) = run_command(cli) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
