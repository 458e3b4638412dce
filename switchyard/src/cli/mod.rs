mod report;

use crate::app::App;
use crate::dispatch::{ConnInfo, NetworkAddr, NetworkType};
use anyhow::anyhow;
use clap::{Args, Subcommand, ValueHint};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Args)]
pub struct PathOptions {
    /// Path of configuration. Default to $HOME/.config/switchyard
    #[arg(short, long, value_hint = ValueHint::DirPath)]
    pub config: Option<PathBuf>,
    /// Path of application data. Default to $HOME/.local/share/switchyard
    #[arg(short = 'd', long = "data", value_hint = ValueHint::DirPath)]
    pub app_data: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct StartOptions {
    #[command(flatten)]
    pub paths: PathOptions,
    /// Print logs as JSON lines
    #[arg(long)]
    pub json_log: bool,
}

#[derive(Debug, Args)]
pub struct RouteOptions {
    #[command(flatten)]
    pub paths: PathOptions,
    /// Destination, either domain:port or ip:port
    #[clap(value_hint = ValueHint::Other)]
    pub dst: String,
    #[arg(long, default_value = "127.0.0.1:50000")]
    pub src: SocketAddr,
    /// tcp or udp
    #[arg(short, long, default_value = "tcp")]
    pub network: String,
    /// Name of the process owning the connection
    #[arg(short, long)]
    pub process: Option<String>,
    /// Print the decision as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Subcommand)]
pub enum SubCommand {
    /// Start the routing core and serve until Ctrl-C
    Start(StartOptions),
    /// Load the configuration once and list the resulting groups
    Check(PathOptions),
    /// Show where one connection would be sent
    Route(RouteOptions),
}

/// Commands that build one generation, report and exit.
pub async fn offline_main(cmd: SubCommand) -> anyhow::Result<()> {
    match cmd {
        SubCommand::Start(_) => Err(anyhow!("start runs the core and is not an offline command")),
        SubCommand::Check(paths) => {
            let app = create_app(&paths).await?;
            let controller = app.controller();
            report::print_groups(&controller.get_all_proxies());
            report::print_providers(&controller.get_providers());
            Ok(())
        }
        SubCommand::Route(opt) => {
            let dst = NetworkAddr::parse(opt.dst.as_str())
                .ok_or_else(|| anyhow!("Invalid destination {}", opt.dst))?;
            let network = NetworkType::from_str(opt.network.as_str())
                .map_err(|_| anyhow!("Unknown network {}", opt.network))?;
            let mut info = ConnInfo::new(opt.src, dst, network);
            if let Some(name) = &opt.process {
                info = info.with_process(name.as_str());
            }
            let app = create_app(&opt.paths).await?;
            let result = app.controller().route(info).await;
            if opt.json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                report::print_route(opt.dst.as_str(), &result);
            }
            Ok(())
        }
    }
}

async fn create_app(paths: &PathOptions) -> anyhow::Result<App> {
    let (config_path, data_path) = crate::config::parse_paths(&paths.config, &paths.app_data)?;
    App::create(config_path, data_path).await
}

#[tokio::test]
async fn test_offline_rejects_start() {
    let cmd = SubCommand::Start(StartOptions {
        paths: PathOptions {
            config: None,
            app_data: None,
        },
        json_log: false,
    });
    assert!(offline_main(cmd).await.is_err());
}
