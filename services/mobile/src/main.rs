//! mobile CLI 入口：控制台日志走 stderr，stdout 留给命令输出。

mod cli;
mod config;
mod rpc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_runtime = cs_endpoint_core::logging::init("mobile", true, "warn")?;

    let args = std::env::args().skip(1).collect::<Vec<String>>();
    cli::dispatch(&args).await
}
