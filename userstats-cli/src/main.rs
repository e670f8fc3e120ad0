//! Entry point for the command-line interface.
#![forbid(unsafe_code)]

use env_logger::Env;

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();
    if let Err(err) = userstats_cli::run() {
        eprintln!("userstats: {err}");
        std::process::exit(1);
    }
}
