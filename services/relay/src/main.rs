//! Relay 二进制入口：仅负责 CLI 分发与启动应用。

mod app;
mod auth;
mod cli;
mod config;
mod logging;
mod pairing;
mod registry;
mod state;
mod ws;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = std::env::args().skip(1).collect::<Vec<String>>();
    match cli::dispatch(&args)? {
        cli::CliDispatch::Run => {}
        cli::CliDispatch::Exit => return Ok(()),
    }

    let _log_runtime = logging::init("relay")?;
    app::run().await
}
