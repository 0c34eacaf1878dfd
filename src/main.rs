/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use colored::Colorize;
use lockstep::{
    clap_args::{self, Commands},
    config::Config,
    error::OrchestratorError,
    summary,
};
use tracing::{error, subscriber::set_global_default, Subscriber};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = clap_args::parse();
    init_subscriber(get_subscriber(args.verbose))?;

    match args.command {
        Commands::Run { config } => {
            let config = Config::try_from_path(&config)?;

            match lockstep::run(&config).await {
                Ok(records) => {
                    println!("\n{}", " Summary ".reversed().green());
                    println!("{}", summary::results_table(&records));
                    println!(
                        "> results saved in {}",
                        config.benchmark.results_dir.display()
                    );
                }
                Err(err) => {
                    error!("[{}] {}", err.as_label(), err);
                    let code = match err {
                        OrchestratorError::Interrupted => 130,
                        _ => 1,
                    };
                    std::process::exit(code);
                }
            }
        }

        Commands::Check { config } => {
            let config = Config::try_from_path(&config)?;
            let plans = lockstep::plan(&config)?;

            println!("{}", " Planned units ".reversed().green());
            println!("{}", summary::plan_table(config.benchmark.exec_env, &plans));
        }
    }

    Ok(())
}

fn get_subscriber(verbose: bool) -> impl Subscriber + Sync + Send {
    let env_filter = match verbose {
        true => EnvFilter::new("debug"),
        false => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .finish()
}

fn init_subscriber(subscriber: impl Subscriber + Sync + Send) -> anyhow::Result<()> {
    set_global_default(subscriber)?;
    Ok(())
}
