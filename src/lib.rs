pub mod cli;
pub mod config;
pub mod error;
pub mod integrations;
pub mod leads;
pub mod sync;

use clap::Parser;

pub fn run() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = cli::Cli::parse();

    // Every job is a sequential batch; one thread is enough.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(cli::execute(cli))
}
