// ABOUTME: Entry point for the tfledger binary.
// ABOUTME: Parses CLI arguments, initializes tracing, opens the configured store, and runs one command.

use std::io::Write;

use anyhow::{Context, Result, bail};
use chrono::{Local, Utc};
use clap::{Args, Parser, Subcommand};
use tfledger_core::{ListQuery, ListedRun, Run, Status, since};
use tfledger_store::{LocalStore, RunStore, StoreConfig, StoreKind, open_store};

#[derive(Parser)]
#[command(name = "tfledger", version)]
#[command(about = "Journal of infrastructure-as-code runs, mirrored to object storage")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List recorded runs, newest first
    List(ListArgs),
    /// Show one run
    Show {
        id: String,
        /// Print the record as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the captured output of a run
    Output { id: String },
    /// Delete a run and its output everywhere
    Delete { id: String },
    /// Upload local runs missing from the bucket
    Sync,
    /// Show the store configuration, or where a single run lives
    Status { id: Option<String> },
}

#[derive(Args)]
struct ListArgs {
    /// Workspace pattern; `*` or `%` match anything, `?` one character
    workspace: Option<String>,
    /// Only runs newer than this window, e.g. 7d, 24h, 30m
    #[arg(long)]
    since: Option<String>,
    #[arg(long)]
    status: Option<Status>,
    #[arg(long)]
    user: Option<String>,
    #[arg(long)]
    program: Option<String>,
    #[arg(long)]
    branch: Option<String>,
    /// Only runs that added, changed, or destroyed something
    #[arg(long)]
    has_changes: bool,
    /// Maximum runs to show; 0 for all
    #[arg(long, default_value_t = 20)]
    limit: usize,
    /// Skip the bucket and list the local journal only
    #[arg(long)]
    local: bool,
    #[arg(long)]
    json: bool,
}

impl ListArgs {
    fn query(&self) -> Result<ListQuery> {
        let since = match &self.since {
            Some(window) => Some(since::since(window, Utc::now())?),
            None => None,
        };
        Ok(ListQuery {
            workspace: self.workspace.clone(),
            since,
            status: self.status,
            user: self.user.clone(),
            program: self.program.clone(),
            branch: self.branch.clone(),
            has_changes: self.has_changes,
            limit: self.limit,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("tfledger=info,tfledger_store=warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = StoreConfig::from_env().context("invalid configuration")?;
    let store = open_store(&config)
        .with_context(|| format!("failed to open run store at {}", config.local_path.display()))?;

    let result = execute(cli.command, store.as_ref(), &config).await;

    if let Err(e) = store.close().await {
        tracing::warn!("error while closing store: {}", e);
    }
    if let Some(hybrid) = store.as_hybrid()
        && hybrid.mirror_failures() > 0
    {
        tracing::warn!(
            "{} background uploads failed; run `tfledger sync` to retry",
            hybrid.mirror_failures()
        );
    }

    result
}

async fn execute(command: Commands, store: &dyn RunStore, config: &StoreConfig) -> Result<()> {
    match command {
        Commands::List(args) => list(store, &args).await,
        Commands::Show { id, json } => {
            let run = store.get_run(&id).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&run)?);
            } else {
                print_run(&run, &store.output_path(&id));
            }
            Ok(())
        }
        Commands::Output { id } => {
            let output = store.get_output(&id).await?;
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&output)?;
            stdout.flush()?;
            Ok(())
        }
        Commands::Delete { id } => {
            store.delete_run(&id).await?;
            println!("deleted {id}");
            Ok(())
        }
        Commands::Sync => {
            if store.kind() != StoreKind::Hybrid {
                bail!("sync needs a bucket: set TFLEDGER_S3_BUCKET");
            }
            let result = store.sync().await?;
            println!("uploaded {} runs, {} errors", result.uploaded, result.errors);
            if result.errors > 0 {
                bail!("{} runs failed to upload", result.errors);
            }
            Ok(())
        }
        Commands::Status { id: Some(id) } => {
            match store.as_hybrid() {
                Some(hybrid) => match hybrid.provenance(&id).await? {
                    Some(status) => println!("{id}: {status}"),
                    None => bail!("run not found: {id}"),
                },
                None if store.has_run(&id).await? => println!("{id}: local"),
                None => bail!("run not found: {id}"),
            }
            Ok(())
        }
        Commands::Status { id: None } => status(store, config).await,
    }
}

async fn list(store: &dyn RunStore, args: &ListArgs) -> Result<()> {
    let query = args.query()?;
    let listing = match store.as_hybrid() {
        Some(hybrid) if args.local => hybrid.list_runs_local(&query).await?,
        _ => store.list_runs(&query).await?,
    };

    if listing.offline {
        eprintln!("warning: bucket unreachable, showing local runs only");
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&listing.runs)?);
        return Ok(());
    }

    if listing.is_empty() {
        println!("no runs found");
        return Ok(());
    }

    println!(
        "{:<32} {:<16} {:<24} {:<9} {:<12} {:<12} SYNC",
        "ID", "TIME", "WORKSPACE", "STATUS", "CHANGES", "USER"
    );
    for listed in &listing.runs {
        print_row(listed);
    }
    Ok(())
}

fn print_row(listed: &ListedRun) {
    let run = &listed.run;
    println!(
        "{:<32} {:<16} {:<24} {:<9} {:<12} {:<12} {}",
        run.id,
        run.timestamp.with_timezone(&Local).format("%Y-%m-%d %H:%M"),
        truncate(&run.workspace, 24),
        run.status,
        run.change_summary(),
        truncate(&run.user, 12),
        listed
            .sync_status
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".to_string()),
    );
}

fn print_run(run: &Run, output_path: &str) {
    println!("ID:        {}", run.id);
    println!("Workspace: {}", run.workspace);
    println!(
        "Time:      {}",
        run.timestamp.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S %Z")
    );
    println!("Status:    {} (exit {})", run.status, run.exit_code);
    println!("Duration:  {:.1}s", run.duration().as_secs_f64());
    println!("Command:   {}", run.command.join(" "));
    if !run.user.is_empty() {
        match &run.user_email {
            Some(email) => println!("User:      {} <{}>", run.user, email),
            None => println!("User:      {}", run.user),
        }
    }
    if let Some(git) = &run.git {
        let dirty = if git.dirty { " (dirty)" } else { "" };
        println!("Git:       {}@{}{}", git.branch, git.commit, dirty);
    }
    if let Some(ci) = &run.ci {
        println!("CI:        {}", ci.provider);
        if let Some(url) = &ci.url {
            println!("           {}", url);
        }
    }
    println!("Changes:   {}", run.change_summary());
    if !run.resources.is_empty() {
        println!("Resources:");
        for event in &run.resources {
            println!(
                "  {:<8} {:<10} {} ({}ms)",
                format!("{:?}", event.action).to_lowercase(),
                format!("{:?}", event.status).to_lowercase(),
                event.address,
                event.duration_ms
            );
        }
    }
    println!("Output:    {}", output_path);
}

async fn status(store: &dyn RunStore, config: &StoreConfig) -> Result<()> {
    println!("backend:   {:?}", store.kind());
    println!("local:     {}", config.local_path.display());

    let local = match store.as_hybrid() {
        Some(hybrid) => hybrid.local().clone(),
        None => LocalStore::open(&config.local_path)?,
    };
    println!("runs:      {} local", local.list_run_ids()?.len());

    if let Some(hybrid) = store.as_hybrid() {
        println!("bucket:    {}", hybrid.remote().bucket());
        match hybrid.remote_run_ids().await {
            Ok(ids) => println!("           {} remote", ids.len()),
            Err(e) => println!("           remote unreachable: {e}"),
        }
    }
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{head}…")
    }
}
