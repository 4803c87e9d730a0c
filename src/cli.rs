use anyhow::{Result, anyhow};
use pico_args::Arguments;
use std::{env, path::PathBuf};

use crate::config::ProxyConfig;
use crate::server;

fn load_config(pargs: &mut Arguments) -> Result<ProxyConfig> {
    let path: Option<PathBuf> = pargs.opt_value_from_str("--config")?;
    ProxyConfig::load(path.as_deref())
}

/// `--bind` and port flags win over the file.
fn apply_overrides(cfg: &mut ProxyConfig, pargs: &mut Arguments) -> Result<()> {
    if let Some(bind) = pargs.opt_value_from_str::<_, String>("--bind")? {
        cfg.server.bind = bind;
    }
    if let Some(p) = pargs.opt_value_from_str("--rover-port")? {
        cfg.server.rover_port = p;
    }
    if let Some(p) = pargs.opt_value_from_str("--control-port")? {
        cfg.server.control_port = p;
    }
    if let Some(p) = pargs.opt_value_from_str("--stream-port")? {
        cfg.server.stream_port = p;
    }
    cfg.validate()
}

pub fn run() -> Result<()> {
    let mut pargs = Arguments::from_env();

    // No args -> general help
    if env::args().len() == 1 {
        print_help();
        return Ok(());
    }

    if pargs.contains("-h") || pargs.contains("--help") {
        print_help();
        return Ok(());
    }

    // First free arg is the subcommand
    let subcmd: Option<String> = pargs.free_from_str().ok();

    match subcmd.as_deref() {
        Some("help") => {
            let topic: Option<String> = pargs.free_from_str().ok();
            if let Some(t) = topic {
                print_subcmd_help(&t);
            } else {
                print_help();
            }
            Ok(())
        }

        Some("serve") => {
            let mut cfg = load_config(&mut pargs)?;
            apply_overrides(&mut cfg, &mut pargs)?;
            reject_leftovers(pargs)?;
            server::run_daemon(cfg)
        }

        Some("list") => {
            let addr: Option<String> = pargs.opt_value_from_str("--addr")?;
            let addr = match addr {
                Some(a) => a,
                None => {
                    let cfg = load_config(&mut pargs)?;
                    format!("127.0.0.1:{}", cfg.server.control_port)
                }
            };
            reject_leftovers(pargs)?;
            let r = server::list_rovers(&addr)?;
            print_response(&r);
            Ok(())
        }

        Some("config") => {
            let cfg = load_config(&mut pargs)?;
            reject_leftovers(pargs)?;
            print_response(&serde_json::to_value(&cfg)?);
            Ok(())
        }

        Some(other) => {
            eprintln!("unknown subcommand: {other}\n");
            print_help();
            Ok(())
        }

        None => {
            print_help();
            Ok(())
        }
    }
}

fn reject_leftovers(pargs: Arguments) -> Result<()> {
    let rest = pargs.finish();
    if rest.is_empty() {
        Ok(())
    } else {
        Err(anyhow!("unexpected arguments: {rest:?}"))
    }
}

fn print_help() {
    println!(
        r#"rover-proxy: video and control relay between rovers and their clients

USAGE:
  rover-proxy help [command]              Show general or command-specific help
  rover-proxy serve [options]             Run the proxy in the foreground
  rover-proxy list [--addr HOST:PORT]     List rovers registered with a running proxy
  rover-proxy config [--config PATH]      Print the effective configuration

TIPS:
  - Default config: ~/.config/rover-proxy/proxy.toml (installed on first run)
  - Log level: RUST_LOG=rover_proxy=debug
"#
    );
}

fn print_subcmd_help(cmd: &str) {
    match cmd {
        "serve" => println!(
            "usage: rover-proxy serve [--config PATH] [--bind ADDR] [--rover-port N] \
             [--control-port N] [--stream-port N]\n\
             Accepts rovers, control clients and stream viewers until SIGINT/SIGTERM."
        ),
        "list" => println!(
            "usage: rover-proxy list [--addr HOST:PORT] [--config PATH]\n\
             Connects as a control client and prints the rover list."
        ),
        "config" => println!(
            "usage: rover-proxy config [--config PATH]\nPrints the configuration as JSON."
        ),
        _ => {
            eprintln!("unknown command: {cmd}\n");
            print_help();
        }
    }
}

fn print_response(v: &serde_json::Value) {
    println!("{}", serde_json::to_string_pretty(v).unwrap_or_default());
}
