use clap::Parser;

use aircheck::{Cli, Config, Engine, Error};

/// Exit codes: 0 clean shutdown, 2 invalid configuration, 1 runtime failure.
fn main() {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default())
        .filter_level(cli.log_level())
        .init();

    let config = match Config::from_cli(cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("aircheck: {}", e);
            std::process::exit(2);
        }
    };

    let mut engine = match Engine::new(config) {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("aircheck: {}", e);
            std::process::exit(match e {
                Error::InvalidConfig(_) => 2,
                _ => 1,
            });
        }
    };

    if let Err(e) = engine.run() {
        eprintln!("aircheck: {}", e);
        std::process::exit(1);
    }
}
