use clap::Parser;
use std::process::ExitCode;
use std::time::Duration;
use switchyard::app::App;
use switchyard::cli::{self, SubCommand};

#[derive(Debug, Parser)]
#[command(name = "switchyard", about = "Rule-based outbound selection core")]
struct ProgramArgs {
    #[command(subcommand)]
    pub cmd: SubCommand,
}

fn main() -> ExitCode {
    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };
    let _guard = rt.enter();
    let args: ProgramArgs = ProgramArgs::parse();
    let cmds = match args.cmd {
        SubCommand::Start(sub) => sub,
        cmd => {
            if let Err(e) = switchyard::external::init_tracing(false) {
                eprintln!("{e}");
            }
            return match rt.block_on(cli::offline_main(cmd)) {
                Ok(_) => ExitCode::SUCCESS,
                Err(e) => {
                    eprintln!("{e}");
                    ExitCode::FAILURE
                }
            };
        }
    };
    if let Err(e) = switchyard::external::init_tracing(cmds.json_log) {
        eprintln!("{e}");
        return ExitCode::FAILURE;
    }
    let (config_path, data_path) =
        match switchyard::config::parse_paths(&cmds.paths.config, &cmds.paths.app_data) {
            Ok(r) => r,
            Err(e) => {
                eprintln!("Failed to load config and app data: {}", e);
                return ExitCode::FAILURE;
            }
        };
    if !config_path.try_exists().is_ok_and(|x| x) {
        eprintln!("Config path {} not found.", config_path.to_string_lossy());
        return ExitCode::FAILURE;
    }
    let app = match rt.block_on(App::create(config_path, data_path)) {
        Ok(app) => app,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };
    rt.block_on(app.serve_command());
    tracing::info!("Exiting...");
    rt.shutdown_timeout(Duration::from_millis(300));
    ExitCode::SUCCESS
}
