//! deployctl - CLI client for deployd

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

mod client;
mod render;

use std::io::Write;
use std::time::Duration;

use clap::{Parser, Subcommand};
use client::{Client, ClientError, CreateDeployRequest, CreateServiceRequest, DEFAULT_WAIT_TIMEOUT};

/// Interval between status or log polls in follow modes.
const FOLLOW_INTERVAL: Duration = Duration::from_secs(2);

/// CLI client for the deployd daemon.
#[derive(Parser)]
#[command(name = "deployctl")]
#[command(about = "Trigger deploys and inspect CI builds through deployd")]
#[command(version)]
struct Cli {
    /// Daemon address (default: http://127.0.0.1:8000)
    #[arg(long, global = true, env = "DEPLOYD_ADDR")]
    addr: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a deploy for a service
    Deploy {
        /// Service the deploy belongs to
        #[arg(long)]
        service: i64,

        /// Deployment prefix (lowercase letters, digits, hyphens)
        #[arg(long)]
        prefix: String,

        /// Repository URL
        #[arg(long)]
        repo: String,

        /// Branch to build (default: main)
        #[arg(long)]
        branch: Option<String>,

        /// Build with the repository's own Dockerfile
        #[arg(long)]
        repo_dockerfile: bool,

        /// Frontend stack (default: react-vite)
        #[arg(long)]
        frontend_stack: Option<String>,

        /// Access token for private repositories
        #[arg(long, env = "DEPLOYCTL_GIT_PAT", hide_env_values = true)]
        git_pat: Option<String>,

        /// Commit id to record (looked up from the branch head when omitted)
        #[arg(long)]
        commit_id: Option<String>,

        /// Commit message to record
        #[arg(long)]
        commit_message: Option<String>,

        /// Wait for the deploy to finish
        #[arg(long)]
        wait: bool,

        /// Give up waiting after this many seconds (default: 2100)
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Show a deploy
    Status {
        deploy_id: i64,

        /// Keep polling until the deploy finishes
        #[arg(long)]
        wait: bool,

        /// Give up waiting after this many seconds (default: 2100)
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// List recent deploys of a service
    History {
        service_id: i64,

        #[arg(long)]
        limit: Option<u32>,
    },

    /// Print the stored logs of a deploy
    Log { deploy_id: i64 },

    /// Read a CI build's console output
    Tail {
        build_number: u64,

        /// Byte offset to start from
        #[arg(long, default_value = "0")]
        offset: u64,

        /// Keep reading until the build stops producing output
        #[arg(short, long)]
        follow: bool,
    },

    /// List a user's services
    Services { user_id: i64 },

    /// Register a service
    AddService {
        #[arg(long)]
        user: i64,
        #[arg(long)]
        name: String,
        #[arg(long)]
        domain: String,
        #[arg(long)]
        repo: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let addr = cli
        .addr
        .unwrap_or_else(|| "http://127.0.0.1:8000".to_string());
    let client = Client::new(&addr);

    let result = match cli.command {
        Command::Deploy {
            service,
            prefix,
            repo,
            branch,
            repo_dockerfile,
            frontend_stack,
            git_pat,
            commit_id,
            commit_message,
            wait,
            timeout,
        } => {
            let req = CreateDeployRequest {
                service_id: service,
                prefix,
                git_repo: repo,
                branch,
                use_repo_dockerfile: repo_dockerfile,
                frontend_stack,
                git_pat,
                commit_id,
                commit_message,
            };
            run_deploy(&client, &req, wait.then(|| wait_limit(timeout))).await
        }
        Command::Status {
            deploy_id,
            wait,
            timeout,
        } => run_status(&client, deploy_id, wait.then(|| wait_limit(timeout))).await,
        Command::History { service_id, limit } => run_history(&client, service_id, limit).await,
        Command::Log { deploy_id } => run_log(&client, deploy_id).await,
        Command::Tail {
            build_number,
            offset,
            follow,
        } => run_tail(&client, build_number, offset, follow).await,
        Command::Services { user_id } => run_services(&client, user_id).await,
        Command::AddService {
            user,
            name,
            domain,
            repo,
        } => {
            let req = CreateServiceRequest {
                user_id: user,
                name,
                domain,
                git_repo: repo,
            };
            run_add_service(&client, &req).await
        }
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    }
}

fn wait_limit(timeout: Option<u64>) -> Duration {
    timeout.map_or(DEFAULT_WAIT_TIMEOUT, Duration::from_secs)
}

async fn run_deploy(
    client: &Client,
    req: &CreateDeployRequest,
    wait: Option<Duration>,
) -> Result<i32, ClientError> {
    let response = client.create_deploy(req).await?;
    println!("Accepted deploy {}", response.deploy.id);
    render::print_deploy(&response.deploy, response.progress.as_ref());

    if wait.is_some() {
        return run_status(client, response.deploy.id.0, wait).await;
    }
    Ok(0)
}

async fn run_status(
    client: &Client,
    deploy_id: i64,
    wait: Option<Duration>,
) -> Result<i32, ClientError> {
    let Some(max_wait) = wait else {
        let response = client.get_deploy(deploy_id).await?;
        render::print_deploy(&response.deploy, response.progress.as_ref());
        return Ok(0);
    };

    let mut last_stage = None;
    let response = client
        .wait_for_deploy(deploy_id, FOLLOW_INTERVAL, max_wait, |progress| {
            let stage = render::format_progress(progress);
            if last_stage.as_ref() != Some(&stage) {
                eprintln!("deploy {deploy_id}: {stage}");
                last_stage = Some(stage);
            }
        })
        .await?;

    render::print_deploy(&response.deploy, response.progress.as_ref());
    if !response.deploy.status.is_terminal() {
        eprintln!(
            "deploy {deploy_id} still {} after {}s; its outcome is unknown",
            response.deploy.status.as_str(),
            max_wait.as_secs()
        );
    }
    Ok(render::exit_code(response.deploy.status))
}

async fn run_history(
    client: &Client,
    service_id: i64,
    limit: Option<u32>,
) -> Result<i32, ClientError> {
    let deploys = client.list_deploys(service_id, limit).await?;
    render::print_deploy_list(&deploys);
    Ok(0)
}

async fn run_log(client: &Client, deploy_id: i64) -> Result<i32, ClientError> {
    let log = client.get_deploy_log(deploy_id).await?;
    render::print_stored_log(&log);
    Ok(0)
}

async fn run_tail(
    client: &Client,
    build_number: u64,
    mut offset: u64,
    follow: bool,
) -> Result<i32, ClientError> {
    let mut stdout = std::io::stdout();
    loop {
        let chunk = client.log_chunk(build_number, offset).await?;
        if !chunk.text.is_empty() {
            print!("{}", chunk.text);
            let _ = stdout.flush();
        }
        offset = chunk.next_offset;

        if !follow || !chunk.has_more {
            return Ok(0);
        }
        tokio::time::sleep(FOLLOW_INTERVAL).await;
    }
}

async fn run_services(client: &Client, user_id: i64) -> Result<i32, ClientError> {
    let services = client.list_services(user_id).await?;
    render::print_service_list(&services);
    Ok(0)
}

async fn run_add_service(
    client: &Client,
    req: &CreateServiceRequest,
) -> Result<i32, ClientError> {
    let service = client.create_service(req).await?;
    println!("Created service {} ({})", service.id, service.name);
    Ok(0)
}
