use clap::Parser;
use ppg_lib::cli::{self, Cli};

fn main() {
    let cli = Cli::parse();
    ppg_lib::init_tracing(cli.log_level.as_deref());

    match cli::run(cli) {
        Ok(Some(value)) => match serde_json::to_string_pretty(&value) {
            Ok(text) => println!("{}", text),
            Err(e) => {
                tracing::error!("Could not render output: {}", e);
                std::process::exit(1);
            }
        },
        Ok(None) => {}
        Err(e) => {
            tracing::debug!("Command failed: {:?}", e);
            cli::print_error(&e);
            std::process::exit(1);
        }
    }
}
