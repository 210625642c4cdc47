use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use shepherd::config::{AppConfig, LogFormat};
use shepherd::shutdown::cancel_on_signal;
use shepherd::workflow::{CommitRecord, ImplementationFlow, WorkflowRequest, WorkflowResult};

#[derive(Parser)]
#[command(
    name = "shepherd",
    version,
    about = "Research, implement, review and push a change to a git repository"
)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Implement a task against a repository
    Implement {
        /// Path to the repository
        repo: PathBuf,

        /// Description of the feature, bug or task
        #[arg(short, long)]
        issue: String,

        /// Branch to create (generated from the issue when omitted)
        #[arg(short, long)]
        branch: Option<String>,

        /// Work in a separate git worktree
        #[arg(short, long)]
        worktree: bool,

        /// Commit locally but do not push
        #[arg(long)]
        no_push: bool,

        /// Skip research and review and use the fast model
        #[arg(short, long)]
        fast: bool,

        /// Verbose output
        #[arg(short = 'V', long)]
        verbose: bool,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,

        /// Accept the issue text without the length and entropy checks
        #[arg(long, alias = "skip-validation")]
        force: bool,
    },
    /// Show the effective configuration and check it is usable
    Config,
}

fn init_tracing(config: &AppConfig, verbose: bool) {
    let default_level = if verbose {
        "debug".to_string()
    } else {
        config.log.level.clone()
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let registry = tracing_subscriber::registry().with(filter);
    match config.log.format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init(),
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
    }
}

fn print_summary(result: &WorkflowResult) {
    println!("Run:       {}", result.run_id);
    println!("Status:    {}", result.final_status);
    println!(
        "Branch:    {}",
        result.branch_name.as_deref().unwrap_or("N/A")
    );
    if let Some(path) = &result.workspace_path {
        println!("Workspace: {}", path.display());
    }
    match &result.commit {
        CommitRecord::Committed { sha } => println!("Commit:    {sha}"),
        CommitRecord::NoChanges => println!("Commit:    no changes"),
        CommitRecord::NotAttempted => println!("Commit:    not attempted"),
    }
    println!("Pushed:    {}", if result.pushed { "yes" } else { "no" });
    if let Some(review) = &result.review {
        println!("Review:    {:?}", review.verdict);
    }
    if !result.changes_made.is_empty() {
        println!("Changes:");
        for change in &result.changes_made {
            println!("  {:?} {}", change.kind, change.path);
        }
    }
    if let Some(error) = &result.error {
        println!(
            "Error:     [{}] {} during {}{}",
            error.kind,
            error.message,
            error.stage,
            if error.retryable { " (retryable)" } else { "" }
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load(cli.config.as_deref())?;

    match cli.command {
        Command::Config => {
            init_tracing(&config, false);
            print!("{}", config.redacted_toml()?);
            if config.claude_api_key().is_none() {
                anyhow::bail!(
                    "no Claude API key configured (set ANTHROPIC_API_KEY or SHEPHERD__CLAUDE__API_KEY)"
                );
            }
            println!("\n# Claude API key: present");
            Ok(())
        }
        Command::Implement {
            repo,
            issue,
            branch,
            worktree,
            no_push,
            fast,
            verbose,
            json,
            force,
        } => {
            init_tracing(&config, verbose);

            if config.claude_api_key().is_none() {
                anyhow::bail!(
                    "no Claude API key configured (set ANTHROPIC_API_KEY or SHEPHERD__CLAUDE__API_KEY)"
                );
            }

            let request = WorkflowRequest {
                repo_path: repo,
                issue_description: issue,
                branch_name: branch,
                use_worktree: worktree,
                auto_push: !no_push,
                verbose,
                fast_mode: fast,
                skip_validation: force,
            };

            let flow = ImplementationFlow::from_config(&config);
            let signals = tokio::spawn(cancel_on_signal(flow.cancellation_token()));
            let result = flow.run(request).await;
            signals.abort();

            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                print_summary(&result);
            }

            std::process::exit(result.final_status.exit_code());
        }
    }
}
