use std::process;

use env_logger::{Builder, Env};

fn main() {
    Builder::from_env(Env::default().default_filter_or("info")).init();
    if let Err(e) = picochain::cli::run() {
        eprintln!("{}", e);
        process::exit(1);
    }
}
