mod gateway;
mod standalone;
mod worker;

use anyhow::{Result, anyhow, bail};
use console::style;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

use crate::core::config::Settings;
use crate::core::correlator::CorrelationLimits;
use crate::core::llm::{CompletionClient, OpenAiClient};
use crate::core::terminal::{self, GuideSection, print_error};
use crate::logging;

fn print_help() {
    terminal::print_banner();

    GuideSection::new("Roles")
        .command("gateway", "HTTP gateway plus the background response consumer")
        .command("worker", "One worker lane: request queue -> LLM -> response queue")
        .command("standalone", "Gateway and workers in one process over an in-memory broker")
        .print();

    GuideSection::new("Options")
        .command("--config <file>", "TOML settings file (environment variables still win)")
        .command("--api-host <host>", "Gateway bind address (default 127.0.0.1)")
        .command("--api-port <port>", "Gateway port (default 8000)")
        .command("--workers <n>", "standalone only: number of worker lanes (default 1)")
        .print();

    GuideSection::new("Environment")
        .text("BROKER_URL or BROKER_HOST / BROKER_PORT / BROKER_USER / BROKER_PASS")
        .text("REQUEST_QUEUE, RESPONSE_QUEUE, OPENAI_API_KEY, OPENAI_MODEL")
        .text("LLM_TIMEOUT_SECS, WAIT_TIMEOUT_SECS, DATABASE_PATH, LOG_FORMAT=json, RUST_LOG")
        .print();

    println!(
        "\n {} {} <role> [options]\n",
        style("Usage:").bold(),
        style("chat-relay").green()
    );
}

/// Flags shared by the process roles. Unset flags leave settings untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct RoleFlags {
    pub config: Option<PathBuf>,
    pub api_host: Option<String>,
    pub api_port: Option<u16>,
    pub workers: Option<usize>,
}

impl RoleFlags {
    fn apply(&self, settings: &mut Settings) {
        if let Some(host) = &self.api_host {
            settings.gateway.api_host = host.clone();
        }
        if let Some(port) = self.api_port {
            settings.gateway.api_port = port;
        }
    }
}

fn flag_value<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a str> {
    args.get(i + 1)
        .map(String::as_str)
        .ok_or_else(|| anyhow!("{flag} requires a value"))
}

pub(crate) fn parse_role_flags(args: &[String], start: usize) -> Result<RoleFlags> {
    let mut flags = RoleFlags::default();
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                flags.config = Some(PathBuf::from(flag_value(args, i, "--config")?));
                i += 2;
            }
            "--api-host" => {
                flags.api_host = Some(flag_value(args, i, "--api-host")?.to_string());
                i += 2;
            }
            "--api-port" => {
                let raw = flag_value(args, i, "--api-port")?;
                flags.api_port = Some(
                    raw.parse()
                        .map_err(|_| anyhow!("--api-port expects a port number, got '{raw}'"))?,
                );
                i += 2;
            }
            "--workers" | "-w" => {
                let raw = flag_value(args, i, "--workers")?;
                let n: usize = raw
                    .parse()
                    .map_err(|_| anyhow!("--workers expects a number, got '{raw}'"))?;
                if n == 0 {
                    bail!("--workers must be at least 1");
                }
                flags.workers = Some(n);
                i += 2;
            }
            other => bail!("unknown option '{other}'"),
        }
    }
    Ok(flags)
}

pub(crate) fn correlation_limits(settings: &Settings) -> CorrelationLimits {
    CorrelationLimits {
        max_parked: settings.gateway.max_parked_results,
        parked_ttl: settings.gateway.parked_result_ttl,
    }
}

pub(crate) fn completion_client(settings: &Settings) -> Result<Arc<dyn CompletionClient>> {
    let api_key = match &settings.llm.api_key {
        Some(key) => key.clone(),
        None => {
            warn!("OPENAI_API_KEY is not set; completion requests will be rejected upstream");
            terminal::print_warn("OPENAI_API_KEY is not set");
            String::new()
        }
    };
    Ok(Arc::new(OpenAiClient::new(
        api_key,
        settings.llm.base_url.clone(),
        settings.llm.model.clone(),
        settings.llm.timeout,
    )?))
}

pub async fn run_main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let cmd = args.get(1).map(String::as_str).unwrap_or("help");

    match cmd {
        "gateway" | "worker" | "standalone" => {
            let flags = parse_role_flags(&args, 2)?;
            if flags.workers.is_some() && cmd != "standalone" {
                bail!("--workers is only valid for standalone; start more worker processes instead");
            }
            let mut settings = Settings::load(flags.config.as_deref())?;
            flags.apply(&mut settings);
            logging::init(&settings.service);

            match cmd {
                "gateway" => gateway::run(settings).await?,
                "worker" => worker::run(settings).await?,
                _ => standalone::run(settings, flags.workers.unwrap_or(1)).await?,
            }
            terminal::print_goodbye();
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_help();
            Ok(())
        }
        other => {
            print_error(&format!("Unknown command '{other}'"));
            print_help();
            bail!("unknown command '{other}'")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_all_role_flags() {
        let a = args(&[
            "chat-relay",
            "standalone",
            "--config",
            "relay.toml",
            "--api-host",
            "0.0.0.0",
            "--api-port",
            "9000",
            "--workers",
            "3",
        ]);
        let flags = parse_role_flags(&a, 2).unwrap();
        assert_eq!(flags.config, Some(PathBuf::from("relay.toml")));
        assert_eq!(flags.api_host.as_deref(), Some("0.0.0.0"));
        assert_eq!(flags.api_port, Some(9000));
        assert_eq!(flags.workers, Some(3));
    }

    #[test]
    fn no_flags_changes_nothing() {
        let flags = parse_role_flags(&args(&["chat-relay", "gateway"]), 2).unwrap();
        assert_eq!(flags, RoleFlags::default());

        let mut settings = Settings::resolve(None, |_| None).unwrap();
        let before = settings.clone();
        flags.apply(&mut settings);
        assert_eq!(settings, before);
    }

    #[test]
    fn flags_override_settings() {
        let flags =
            parse_role_flags(&args(&["chat-relay", "gateway", "--api-port", "8123"]), 2).unwrap();
        let mut settings = Settings::resolve(None, |_| None).unwrap();
        flags.apply(&mut settings);
        assert_eq!(settings.gateway.api_port, 8123);
        assert_eq!(settings.gateway.api_host, "127.0.0.1");
    }

    #[test]
    fn rejects_bad_values() {
        for bad in [
            vec!["x", "gateway", "--api-port", "http"],
            vec!["x", "gateway", "--api-port"],
            vec!["x", "standalone", "--workers", "0"],
            vec!["x", "gateway", "--verbose"],
        ] {
            assert!(parse_role_flags(&args(&bad), 2).is_err(), "{bad:?}");
        }
    }

    #[test]
    fn limits_follow_gateway_settings() {
        let mut settings = Settings::resolve(None, |_| None).unwrap();
        settings.gateway.max_parked_results = 7;
        let limits = correlation_limits(&settings);
        assert_eq!(limits.max_parked, 7);
        assert_eq!(limits.parked_ttl, settings.gateway.parked_result_ttl);
    }
}
