// ABOUTME: `runbox run` command: submits script files as parallel tasks and reports outcomes
// ABOUTME: Wires preauthorized capabilities, the terminal prompt presenter and Ctrl-C cancellation

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Args;
use colored::*;
use runbox_tasks::{
    Capability, EventPrompter, OrchestratorConfig, PermissionPrompter, StaticPrompter, TaskError,
    TaskOrchestrator, TaskSnapshot, TaskState,
};

use super::prompt;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Script files; each runs as a task named after the file
    #[arg(required = true, value_name = "FILES")]
    files: Vec<PathBuf>,

    /// Grant a capability without asking, e.g. `net=example.com` or `read`
    #[arg(long = "allow", value_name = "KIND[=TARGET]")]
    allow: Vec<Capability>,

    /// Refuse a capability without asking
    #[arg(long = "deny", value_name = "KIND[=TARGET]")]
    deny: Vec<Capability>,

    /// Allow every prompt once instead of asking
    #[arg(long, short = 'y')]
    yes: bool,

    /// Cancel tasks still running after this many seconds
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,

    /// Cancellation grace period in milliseconds
    #[arg(long, value_name = "MS")]
    grace_ms: Option<u64>,

    /// Print the final task snapshots as JSON
    #[arg(long)]
    json: bool,
}

pub async fn execute(args: RunArgs) -> Result<i32> {
    let mut config = OrchestratorConfig::from_env();
    if let Some(ms) = args.grace_ms {
        config = config.with_grace_period(Duration::from_millis(ms));
    }

    let scripts = load_scripts(&args.files)?;

    let (prompter, presenter) = if args.yes {
        let prompter: Arc<dyn PermissionPrompter> = Arc::new(StaticPrompter::allow_all());
        (prompter, None)
    } else {
        let events = Arc::new(EventPrompter::from_env());
        let presenter = prompt::spawn_presenter(events.clone());
        let prompter: Arc<dyn PermissionPrompter> = events;
        (prompter, Some(presenter))
    };

    let orchestrator = Arc::new(TaskOrchestrator::new(config, prompter)?);
    let grace_period = orchestrator.config().grace_period;
    for capability in args.allow {
        orchestrator.preauthorize(capability, true);
    }
    for capability in args.deny {
        orchestrator.preauthorize(capability, false);
    }

    for (task_id, code) in &scripts {
        orchestrator.submit(task_id, code)?;
        if !args.json {
            eprintln!("{} {}", "▶".cyan(), task_id.bold());
        }
    }

    let interrupt = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("{} Cancelling all tasks", "■".yellow());
                orchestrator.shutdown();
            }
        })
    };

    let deadline = args
        .timeout
        .map(|secs| Instant::now() + Duration::from_secs(secs));
    let mut snapshots = Vec::with_capacity(scripts.len());
    for (task_id, _) in &scripts {
        let remaining = deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::MAX);

        let snapshot = match orchestrator.wait_for_terminal(task_id, remaining).await {
            Ok(snapshot) => snapshot,
            Err(TaskError::WaitTimeout { .. }) => {
                eprintln!("{} {} timed out, cancelling", "■".yellow(), task_id.bold());
                orchestrator.cancel(task_id)?;
                orchestrator
                    .wait_for_terminal(task_id, grace_period + Duration::from_secs(1))
                    .await?
            }
            Err(e) => return Err(e.into()),
        };
        snapshots.push(snapshot);
    }

    interrupt.abort();
    if let Some(presenter) = presenter {
        presenter.abort();
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&snapshots)?);
    } else {
        for snapshot in &snapshots {
            print_snapshot(snapshot);
        }
    }

    let failed = snapshots
        .iter()
        .any(|snapshot| snapshot.state == TaskState::Error);
    Ok(if failed { 1 } else { 0 })
}

/// Read every file and derive a unique task id from its name.
fn load_scripts(files: &[PathBuf]) -> Result<Vec<(String, String)>> {
    let mut used = HashSet::new();
    files
        .iter()
        .map(|path| -> Result<(String, String)> {
            let code = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read script {}", path.display()))?;
            Ok((unique_task_id(path, &mut used), code))
        })
        .collect()
}

fn unique_task_id(path: &Path, used: &mut HashSet<String>) -> String {
    let base = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .filter(|stem| !stem.is_empty())
        .unwrap_or_else(|| "task".to_string());

    let mut candidate = base.clone();
    let mut suffix = 2;
    while !used.insert(candidate.clone()) {
        candidate = format!("{}-{}", base, suffix);
        suffix += 1;
    }
    candidate
}

fn print_snapshot(snapshot: &TaskSnapshot) {
    match snapshot.state {
        TaskState::Completed => {
            let result = snapshot
                .result
                .as_ref()
                .map(|value| value.to_string())
                .unwrap_or_else(|| "(no result)".dimmed().to_string());
            println!("{} {} {}", "✓".green(), snapshot.id.bold(), result);
        }
        TaskState::Error => println!(
            "{} {} {}",
            "✗".red(),
            snapshot.id.bold(),
            snapshot.error.as_deref().unwrap_or("unknown error").red()
        ),
        state => println!("{} {} {}", "■".yellow(), snapshot.id.bold(), state),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_unique_task_ids() {
        let mut used = HashSet::new();
        let ids: Vec<_> = ["jobs/fetch.js", "other/fetch.js", "fetch.ts", "report.js"]
            .iter()
            .map(|p| unique_task_id(Path::new(p), &mut used))
            .collect();
        assert_eq!(ids, vec!["fetch", "fetch-2", "fetch-3", "report"]);
    }

    #[test]
    fn test_load_scripts_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("a.js");
        std::fs::write(&present, "returnValue(1);").unwrap();

        let loaded = load_scripts(&[present.clone()]).unwrap();
        assert_eq!(loaded, vec![("a".to_string(), "returnValue(1);".to_string())]);

        let err = load_scripts(&[present, dir.path().join("missing.js")]).unwrap_err();
        assert!(err.to_string().contains("missing.js"));
    }
}
