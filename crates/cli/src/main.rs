use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{ArgAction, Parser, Subcommand};
use lets_core::config::{
    self, ConfigOverrides, load_credentials, load_project_config, merge_project_config,
    resolve_config_dir, save_token,
};
use lets_core::{
    ControlPlane, DEFAULT_MAX_WORKERS, DeployOptions, DeployOutcome, DeployRequest,
    GraphqlControlPlane, GraphqlControlPlaneConfig, OssConnector, ProgressSink, StatusDisplay,
    detect_project_type, run_deploy,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::warn;

mod display;

use display::{ConsoleDisplay, NdjsonEvents};

#[derive(Parser)]
#[command(name = "lets")]
#[command(about = "Deploy the current project to let.sh", long_about = None)]
struct Cli {
    #[arg(long, global = true)]
    json: bool,

    /// Print NDJSON progress and stage events on stdout.
    #[arg(long, global = true)]
    events: bool,

    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Deploy the project in the current directory.
    Deploy {
        /// Project name.
        #[arg(short = 'p', long = "project")]
        project: Option<String>,
        /// Project type, e.g. react.
        #[arg(short = 't', long = "type")]
        project_type: Option<String>,
        /// Static dir to upload (makes the project static).
        #[arg(long = "static")]
        static_dir: Option<String>,
        /// Deploy in mainland China.
        #[arg(long, hide = true, default_value_t = true, action = ArgAction::Set)]
        cn: bool,
        #[arg(long, default_value_t = DEFAULT_MAX_WORKERS)]
        max_workers: usize,
    },
    /// Store the API token. Reads it from stdin when --token is omitted.
    Login {
        #[arg(long)]
        token: Option<String>,
    },
    Config {
        #[command(subcommand)]
        cmd: ConfigCmd,
    },
}

#[derive(Subcommand)]
enum ConfigCmd {
    /// Print a remote preference value.
    Get { key: String },
}

#[derive(Debug, Serialize)]
struct CliError {
    code: &'static str,
    message: String,
    details: serde_json::Value,
    retryable: bool,
}

impl CliError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: serde_json::json!({}),
            retryable: false,
        }
    }

    fn retryable(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: serde_json::json!({}),
            retryable: true,
        }
    }

    fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    lets_core::logging::init_logging(cli.verbose);

    let json = cli.json;
    let code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            emit_error(&e, json);
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let config_dir = resolve_config_dir(cli.config_dir.as_deref()).map_err(map_core_err)?;

    match cli.cmd {
        Command::Deploy {
            project,
            project_type,
            static_dir,
            cn,
            max_workers,
        } => {
            let overrides = ConfigOverrides {
                name: project,
                project_type,
                static_dir,
            };
            deploy_run(&config_dir, overrides, cn, max_workers, cli.json, cli.events).await
        }
        Command::Login { token } => login(&config_dir, token, cli.json),
        Command::Config { cmd } => match cmd {
            ConfigCmd::Get { key } => config_get(&config_dir, &key, cli.json).await,
        },
    }
}

async fn deploy_run(
    config_dir: &Path,
    overrides: ConfigOverrides,
    cn: bool,
    max_workers: usize,
    json: bool,
    events: bool,
) -> Result<(), CliError> {
    let control = connect_control_plane(config_dir)?;

    let project_dir = std::env::current_dir()
        .map_err(|e| CliError::new("fs.error", format!("cannot read current dir: {e}")))?;
    let dir_name = project_dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let detection = detect_project_type(&project_dir);
    let file_config = load_project_config(&project_dir).map_err(map_core_err)?;
    let merged = merge_project_config(
        &dir_name,
        Some(&detection.as_config()),
        file_config.as_ref(),
        &overrides,
    );

    let run_id = format!("run_{}", uuid::Uuid::new_v4());
    let _run_log = match lets_core::logging::start_run_log(config_dir, &merged.name) {
        Ok(guard) => Some(guard),
        Err(e) => {
            warn!(event = "run_log.unavailable", error = %e, "run_log.unavailable");
            None
        }
    };

    let ndjson = events.then(|| Arc::new(NdjsonEvents::new(run_id.clone())));
    let console = (!events && !json).then(|| Arc::new(ConsoleDisplay::new()));
    if let Some(events) = &ndjson {
        events.emit(serde_json::json!({
            "type": "deploy.state",
            "state": "running",
            "name": merged.name,
            "projectType": merged.project_type,
        }));
    } else if console.is_some() {
        println!();
        println!("Detected Project Info");
        println!("name: {}", merged.name);
        println!("type: {}", merged.project_type);
        println!();
    }

    let display: Option<&dyn StatusDisplay> = match (&ndjson, &console) {
        (Some(events), _) => Some(events.as_ref()),
        (None, Some(console)) => Some(console.as_ref()),
        (None, None) => None,
    };
    let progress: Option<Arc<dyn ProgressSink>> = match (&ndjson, &console) {
        (Some(events), _) => Some(events.clone()),
        (None, Some(console)) => Some(console.clone()),
        (None, None) => None,
    };

    let cancel = CancellationToken::new();
    let signal_task = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            cancel.cancel();
        })
    };

    let connector =
        OssConnector::new().map_err(|e| CliError::new("storage.unavailable", e.to_string()))?;
    let mut request = DeployRequest::new(&project_dir, merged.clone());
    request.cn = cn;
    request.max_workers = max_workers;

    let outcome = run_deploy(
        &control,
        &connector,
        request,
        DeployOptions {
            cancel: Some(&cancel),
            progress,
            display,
        },
    )
    .await;
    signal_task.abort();
    if let Some(console) = &console {
        console.finish();
    }
    let outcome = outcome.map_err(map_core_err)?;

    match outcome {
        DeployOutcome::Succeeded {
            deployment_id,
            status,
            upload,
            preview_url,
            details_url,
        } => {
            if let Some(events) = &ndjson {
                events.emit(serde_json::json!({
                    "type": "deploy.state",
                    "state": "succeeded",
                    "deploymentId": deployment_id,
                    "previewUrl": preview_url,
                    "detailsUrl": details_url,
                }));
            } else if json {
                println!(
                    "{}",
                    serde_json::json!({
                        "deploymentId": deployment_id,
                        "name": merged.name,
                        "type": merged.project_type,
                        "status": status,
                        "upload": upload,
                        "previewUrl": preview_url,
                        "detailsUrl": details_url,
                    })
                );
            } else {
                println!("Preview: {preview_url}");
                println!("Details: {details_url}");
            }
        }
        DeployOutcome::Cancelled {
            deployment_id,
            remote_cancelled,
        } => {
            let message = if deployment_id.is_none() || remote_cancelled {
                "Deployment canceled"
            } else {
                "Deployment cancellation failed"
            };
            if let Some(events) = &ndjson {
                events.emit(serde_json::json!({
                    "type": "deploy.state",
                    "state": "cancelled",
                    "deploymentId": deployment_id,
                    "remoteCancelled": remote_cancelled,
                }));
            } else if json {
                println!(
                    "{}",
                    serde_json::json!({
                        "cancelled": true,
                        "deploymentId": deployment_id,
                        "remoteCancelled": remote_cancelled,
                        "message": message,
                    })
                );
            } else {
                eprintln!("{message}");
            }
        }
    }
    Ok(())
}

fn login(config_dir: &Path, token: Option<String>, json: bool) -> Result<(), CliError> {
    let token = match token {
        Some(token) => token,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .map_err(|e| CliError::new("config.read_failed", e.to_string()))?;
            buf
        }
    };
    if token.trim().is_empty() {
        return Err(CliError::new("config.invalid", "token is empty"));
    }
    save_token(config_dir, &token).map_err(map_core_err)?;

    if json {
        println!("{}", serde_json::json!({ "ok": true }));
    } else {
        println!("ok");
    }
    Ok(())
}

async fn config_get(config_dir: &Path, key: &str, json: bool) -> Result<(), CliError> {
    let control = connect_control_plane(config_dir)?;
    let value = control.get_preference(key).await.map_err(map_core_err)?;
    if json {
        println!("{}", serde_json::json!({ "key": key, "value": value }));
    } else {
        println!("{value}");
    }
    Ok(())
}

fn connect_control_plane(config_dir: &Path) -> Result<GraphqlControlPlane, CliError> {
    let credentials = load_credentials(config_dir).map_err(map_core_err)?;
    if !credentials.has_token() {
        return Err(CliError::new(
            "auth.required",
            "please login via `lets login` first",
        ));
    }
    GraphqlControlPlane::new(GraphqlControlPlaneConfig {
        endpoint: config::api_url(),
        token: credentials.token,
    })
    .map_err(map_core_err)
}

async fn shutdown_signal() {
    tokio::select! {
        _ = ctrl_c() => {}
        _ = terminate() => {}
    }
}

async fn ctrl_c() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            term.recv().await;
        }
        Err(_) => std::future::pending::<()>().await,
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}

fn map_core_err(e: lets_core::Error) -> CliError {
    use lets_core::Error;
    match e {
        Error::InvalidConfig { message } => CliError::new("config.invalid", message),
        Error::Capability { project, message } => {
            CliError::new("deploy.capability_denied", message)
                .with_details(serde_json::json!({ "project": project }))
        }
        Error::RemoteDeployFailure { message } => CliError::new("deploy.failed", message),
        Error::Storage { key, message } => CliError::retryable("storage.put_failed", message)
            .with_details(serde_json::json!({ "key": key })),
        Error::Transport { message } => CliError::retryable("api.unavailable", message),
        Error::Cancelled => CliError::new("task.cancelled", "cancelled"),
        Error::Worker { message } => CliError::new("upload.worker_failed", message),
        other @ (Error::Filesystem { .. }
        | Error::Walkdir(_)
        | Error::NonUtf8Path { .. }) => CliError::new("fs.error", other.to_string()),
    }
}

fn emit_error(e: &CliError, json: bool) {
    if !json {
        let _ = writeln!(std::io::stderr(), "error: {}", e.message);
        return;
    }
    let json = serde_json::to_string(e).unwrap_or_else(|_| "{\"code\":\"unknown\",\"message\":\"json encode failed\",\"details\":{},\"retryable\":false}".to_string());
    let _ = writeln!(std::io::stderr(), "{json}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deploy_flags_parse() {
        let cli = Cli::try_parse_from([
            "lets", "--json", "deploy", "-p", "blog", "-t", "hexo", "--static", "public",
        ])
        .unwrap();
        assert!(cli.json);
        match cli.cmd {
            Command::Deploy {
                project,
                project_type,
                static_dir,
                cn,
                max_workers,
            } => {
                assert_eq!(project.as_deref(), Some("blog"));
                assert_eq!(project_type.as_deref(), Some("hexo"));
                assert_eq!(static_dir.as_deref(), Some("public"));
                assert!(cn);
                assert_eq!(max_workers, DEFAULT_MAX_WORKERS);
            }
            _ => panic!("expected deploy"),
        }
    }

    #[test]
    fn cn_flag_can_be_turned_off() {
        let cli = Cli::try_parse_from(["lets", "deploy", "--cn", "false"]).unwrap();
        assert!(matches!(cli.cmd, Command::Deploy { cn: false, .. }));
    }

    #[test]
    fn core_errors_map_to_stable_codes() {
        let e = map_core_err(lets_core::Error::RemoteDeployFailure {
            message: "disk full".to_string(),
        });
        assert_eq!(e.code, "deploy.failed");
        assert_eq!(e.message, "disk full");
        assert!(!e.retryable);

        let e = map_core_err(lets_core::Error::Transport {
            message: "timeout".to_string(),
        });
        assert_eq!(e.code, "api.unavailable");
        assert!(e.retryable);

        let e = map_core_err(lets_core::Error::Storage {
            key: "a/b".to_string(),
            message: "http 403".to_string(),
        });
        assert_eq!(e.code, "storage.put_failed");
        assert_eq!(e.details["key"], "a/b");
    }
}
