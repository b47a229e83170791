//! relay CLI 分发：`run`、`token`、`version`。

use anyhow::anyhow;

use crate::{auth, config::Config};

/// 签发 token 的默认有效期（秒）。
const DEFAULT_TOKEN_TTL_SEC: u64 = 30 * 24 * 3600;

/// CLI 处理结果。
pub(crate) enum CliDispatch {
    /// 继续进入 relay 主循环。
    Run,
    /// 命令已处理完成，主程序应直接退出。
    Exit,
}

/// 解析并执行 relay CLI。
pub(crate) fn dispatch(args: &[String]) -> anyhow::Result<CliDispatch> {
    if args.is_empty() {
        return Ok(CliDispatch::Run);
    }

    let cmd = args[0].trim();
    if cmd.is_empty() || cmd == "run" {
        return Ok(CliDispatch::Run);
    }

    match cmd {
        "-h" | "--help" | "help" => {
            print_help();
            Ok(CliDispatch::Exit)
        }
        "token" => {
            let (user_id, ttl_sec) = parse_token_args(&args[1..])?;
            if std::env::var("CS_AUTH_SIGNING_KEY")
                .map(|v| v.trim().is_empty())
                .unwrap_or(true)
            {
                eprintln!("warning: CS_AUTH_SIGNING_KEY 未设置，该 token 只对同样未配置密钥的本进程有效");
            }
            let cfg = Config::from_env();
            println!("{}", auth::issue_token(&cfg.auth_signing_key, &user_id, ttl_sec));
            Ok(CliDispatch::Exit)
        }
        "version" => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(CliDispatch::Exit)
        }
        other => Err(anyhow!("unknown command: {other}; run `cs-relay --help` for usage")),
    }
}

/// 解析 `token <userId> [--ttl-sec N]`。
fn parse_token_args(args: &[String]) -> anyhow::Result<(String, u64)> {
    let mut user_id: Option<String> = None;
    let mut ttl_sec = DEFAULT_TOKEN_TTL_SEC;

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--ttl-sec" => {
                let raw = iter
                    .next()
                    .ok_or_else(|| anyhow!("--ttl-sec requires a value"))?;
                ttl_sec = raw
                    .parse::<u64>()
                    .map_err(|_| anyhow!("invalid --ttl-sec: {raw}"))?;
            }
            value if user_id.is_none() && !value.starts_with('-') => {
                user_id = Some(value.to_string());
            }
            other => return Err(anyhow!("unexpected argument: {other}")),
        }
    }

    let user_id = user_id.ok_or_else(|| anyhow!("usage: cs-relay token <userId> [--ttl-sec N]"))?;
    Ok((user_id, ttl_sec))
}

fn print_help() {
    println!(
        "cs-relay {}\n\n\
         用法:\n  cs-relay [run]               启动 relay 服务\n  \
         cs-relay token <userId>      用当前签名密钥签发 bearer token\n  \
         cs-relay version             输出版本号\n\n\
         环境变量:\n  CS_RELAY_ADDR / CS_ALLOW_ORIGINS / CS_AUTH_SIGNING_KEY\n  \
         CS_DISABLE_REGISTRATION / CS_KNOWN_USERS / CS_PAIRING_TTL_SEC",
        env!("CARGO_PKG_VERSION")
    );
}
