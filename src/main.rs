mod cli;
mod config;
mod error;
mod frame;
mod geometry;
mod logging;
mod media;
mod protocol;
mod registry;
mod ring;
mod server;
mod session;
mod tracking;
mod vision;

fn main() -> anyhow::Result<()> {
    logging::init();
    cli::run()
}
