//! chanproxy binary: load configuration, bind, and proxy until Ctrl-C.

use std::path::PathBuf;

use anyhow::Result;
use chanproxy::config::parse_channel;
use chanproxy::{Config, ProxyServer};
use clap::Parser;
use mimalloc::MiMalloc;

/// Global allocator configured per M-MIMALLOC-APPS guideline.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser, Debug)]
#[command(name = "chanproxy")]
#[command(version)]
#[command(about = "Single-port TCP proxy multiplexing token-admitted channels")]
struct Cli {
    /// JSON config file (default: $CHANPROXY_CONFIG, then the platform config dir)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Port to listen on
    #[arg(long)]
    port: Option<u16>,

    /// Address to listen on
    #[arg(long)]
    bind: Option<String>,

    /// Preconfigure the server token of a channel (repeatable)
    #[arg(long = "channel", value_name = "NAME=TOKEN", value_parser = parse_channel)]
    channels: Vec<(String, String)>,

    /// Largest accepted frame, in bytes
    #[arg(long)]
    max_frame_bytes: Option<u32>,
}

impl Cli {
    /// Flags take precedence over file and environment settings.
    fn apply_to(&self, config: &mut Config) {
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(bind) = &self.bind {
            config.bind.clone_from(bind);
        }
        config.channels.extend(self.channels.iter().cloned());
        if let Some(max) = self.max_frame_bytes {
            config.max_frame_bytes = max;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;
    cli.apply_to(&mut config);

    let server = ProxyServer::bind(config).await?;
    let handle = server.handle();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                log::info!("[Proxy] Ctrl-C received, shutting down");
                handle.shutdown();
            }
            Err(e) => log::warn!("[Proxy] Cannot listen for Ctrl-C: {e}"),
        }
    });

    server.run().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_config() {
        let cli = Cli::try_parse_from([
            "chanproxy",
            "--port",
            "9001",
            "--bind",
            "127.0.0.1",
            "--channel",
            "/room=tok",
            "--channel",
            "/=rootpw",
            "--max-frame-bytes",
            "4096",
        ])
        .unwrap();

        let mut config = Config::default();
        cli.apply_to(&mut config);
        assert_eq!(config.port, 9001);
        assert_eq!(config.bind, "127.0.0.1");
        assert_eq!(config.channels.get("/room").map(String::as_str), Some("tok"));
        assert_eq!(config.channels.get("/").map(String::as_str), Some("rootpw"));
        assert_eq!(config.max_frame_bytes, 4096);
    }

    #[test]
    fn test_bad_channel_flag_is_rejected() {
        assert!(Cli::try_parse_from(["chanproxy", "--channel", "no-token"]).is_err());
    }

    #[test]
    fn test_no_flags_leave_config_untouched() {
        let cli = Cli::try_parse_from(["chanproxy"]).unwrap();
        let mut config = Config::default();
        cli.apply_to(&mut config);
        assert_eq!(config, Config::default());
    }
}
