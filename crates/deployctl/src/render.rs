//! Output rendering for deployctl.

use deploy_core::{Deploy, DeployProgress, DeployStatus, Log, Service};

/// Print a deploy record and, when known, its live stage.
pub fn print_deploy(deploy: &Deploy, progress: Option<&DeployProgress>) {
    println!("Deploy: {}", deploy.id);
    println!("  Service:  {}", deploy.service_id);
    println!("  Branch:   {}", deploy.git_branch);
    println!(
        "  Commit:   {} {}",
        deploy.commit_id,
        first_line(&deploy.commit_message)
    );
    println!("  Status:   {}", deploy.status.as_str());
    if let Some(number) = deploy.build_number {
        println!("  Build:    #{number}");
    }
    if let Some(progress) = progress {
        println!("  Stage:    {}", format_progress(progress));
    }
    if let Some(ref failure) = deploy.failure {
        println!("  Failure:  [{}] {}", failure.kind.as_str(), failure.message);
    }
    println!("  Created:  {}", format_time(&deploy.created_at));
    if let Some(ref updated) = deploy.updated_at {
        println!("  Updated:  {}", format_time(updated));
    }
}

/// Print deploys in tabular format.
pub fn print_deploy_list(deploys: &[Deploy]) {
    if deploys.is_empty() {
        println!("No deploys found.");
        return;
    }

    println!(
        "{:<8}  {:<12}  {:<8}  {:<12}  {:<30}  {:<20}",
        "ID", "STATUS", "COMMIT", "BRANCH", "MESSAGE", "CREATED"
    );
    println!("{}", "-".repeat(100));

    for deploy in deploys {
        println!(
            "{:<8}  {:<12}  {:<8}  {:<12}  {:<30}  {:<20}",
            deploy.id,
            deploy.status.as_str(),
            deploy.commit_id,
            truncate(&deploy.git_branch, 12),
            truncate(first_line(&deploy.commit_message), 30),
            format_time(&deploy.created_at),
        );
    }
}

pub fn print_service_list(services: &[Service]) {
    if services.is_empty() {
        println!("No services found.");
        return;
    }

    println!("{:<8}  {:<20}  {:<30}  {:<40}", "ID", "NAME", "DOMAIN", "REPOSITORY");
    println!("{}", "-".repeat(104));

    for service in services {
        println!(
            "{:<8}  {:<20}  {:<30}  {:<40}",
            service.id,
            truncate(&service.name, 20),
            truncate(&service.domain, 30),
            service.git_repo,
        );
    }
}

pub fn print_stored_log(log: &Log) {
    for (title, body) in [
        ("Build log", &log.build_log),
        ("Deploy log", &log.deploy_log),
        ("Application log", &log.application_log),
    ] {
        if let Some(body) = body {
            println!("== {title} ==");
            println!("{body}");
        }
    }
}

pub fn format_progress(progress: &DeployProgress) -> String {
    match progress {
        DeployProgress::Triggering => "triggering".to_string(),
        DeployProgress::Queued { queue_id } => format!("queued (item {queue_id})"),
        DeployProgress::Building { build } => format!("building {build}"),
        DeployProgress::Finished { status } => format!("finished ({})", status.as_str()),
    }
}

/// Exit code for a deploy status when waiting from a script.
pub fn exit_code(status: DeployStatus) -> i32 {
    match status {
        DeployStatus::Success => 0,
        DeployStatus::Failed => 1,
        DeployStatus::InProgress | DeployStatus::Archived => 2,
    }
}

fn first_line(s: &str) -> &str {
    s.lines().next().unwrap_or("")
}

fn format_time(dt: &chrono::DateTime<chrono::Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}
