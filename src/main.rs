use std::env;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use arboard::Clipboard;
use clap::{Parser, Subcommand};
use crossterm::{
    execute,
    style::{Color, Print, ResetColor, SetForegroundColor},
};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing_subscriber::EnvFilter;

use gittfs_shell::config::Settings;
use gittfs_shell::events::{Event, EventBus, MessageKind, OperationOutcome};
use gittfs_shell::git_ops::GitCli;
use gittfs_shell::session::{Prompt, Session, ShelveRequest, UnshelveRequest};
use gittfs_shell::shelveset::normalize_branch_name;
use gittfs_shell::tfs::TfClient;
use gittfs_shell::{BridgeError, Result};

/// Run git-tfs in a directory mapped to a TFS workspace.
///
/// The workspace mapping is removed while git-tfs runs and restored
/// afterwards, so Visual Studio and `tf` keep working on the same folder.
///
/// CONFIGURATION:
///   Settings live in $XDG_CONFIG_HOME/gittfs-shell/settings.json.
///   TFS_URI, GIT_TFS_COMMAND, TF_PATH, TFS_SHELVESET_TEMPLATE and TFS_PAT
///   (environment or .env) override them. The token is never saved.
#[derive(Parser)]
#[command(name = "gittfs-shell")]
#[command(version, about)]
struct Cli {
    /// Working directory (default: the last one used, then the current one)
    #[arg(long, short = 'd', global = true)]
    dir: Option<PathBuf>,

    /// Answer yes to every question
    #[arg(long, short = 'y', global = true)]
    yes: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show repository and workspace state
    Info,

    /// Select the directory, offering to clone when it has no repository
    Open,

    /// Fetch TFS changesets with git-tfs, then get latest in the workspace
    Pull,

    /// Shelve the current branch
    Shelve {
        /// Shelveset name (default: from the configured template)
        name: Option<String>,
        /// Shelveset comment (default: the latest commit message)
        #[arg(long, short = 'm')]
        comment: Option<String>,
        /// Commit uncommitted changes first, using the comment as message
        #[arg(long)]
        commit: bool,
    },

    /// Check the current branch in to TFS
    Checkin {
        /// Changeset comment (default: the latest commit message)
        #[arg(long, short = 'm')]
        comment: Option<String>,
    },

    /// Unshelve into a new local branch
    Unshelve {
        name: String,
        /// Branch to create (default: derived from the shelveset)
        #[arg(long, short = 'b')]
        branch: Option<String>,
        /// Shelveset owner (default: you)
        #[arg(long, short = 'u')]
        user: Option<String>,
    },

    /// List shelvesets, newest first
    Shelvesets {
        #[arg(long, short = 'u')]
        user: Option<String>,
        /// Print web links instead of comments
        #[arg(long)]
        url: bool,
    },

    /// Search users of the collection
    Users {
        pattern: Option<String>,
    },

    /// Refresh whenever git changes the repository, until Ctrl-C
    Watch,
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            print_message(MessageKind::Error, &err.to_string());
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<bool> {
    let settings_path = Settings::file_path();
    let mut settings = settings_path
        .as_deref()
        .map(Settings::load)
        .unwrap_or_default();
    settings.apply_env(|key| env::var(key).ok());

    let server = Arc::new(TfClient::new(
        settings.tfs_uri()?,
        settings.tf_tool()?,
        settings.pat.as_deref(),
    )?);
    let repos = Arc::new(GitCli::new(settings.git_program()));

    let directory = match cli.dir.clone().or_else(|| settings.directory.clone()) {
        Some(dir) => dir,
        None => env::current_dir()?,
    };

    let bus = EventBus::new();
    let printer = tokio::spawn(print_events(bus.subscribe()));

    let mut session = Session::new(settings, server, repos, bus)?;
    if let Some(path) = settings_path {
        session = session.persist_to(path);
    }
    let session = Arc::new(session);

    let interrupt = {
        let session = session.clone();
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                session.cancel();
            }
        })
    };

    let prompt = ConsolePrompt { assume_yes: cli.yes };
    let result = dispatch(&session, cli.command, &directory, &prompt).await;

    session.shutdown().await;
    interrupt.abort();
    let _ = interrupt.await;
    drop(session);
    let _ = printer.await;
    result
}

async fn dispatch(
    session: &Session,
    command: Commands,
    directory: &Path,
    prompt: &ConsolePrompt,
) -> Result<bool> {
    if !session.open_directory(directory, prompt).await.is_succeeded() {
        return Ok(false);
    }

    let outcome = match command {
        Commands::Info => {
            print_info(session);
            OperationOutcome::Succeeded
        }
        Commands::Open => OperationOutcome::Succeeded,
        Commands::Pull => session.pull().await,
        Commands::Shelve {
            name,
            comment,
            commit,
        } => {
            let name = name
                .or_else(|| session.suggested_shelveset_name(commit))
                .ok_or_else(|| {
                    BridgeError::InvalidArgument("shelveset name is required".to_string())
                })?;
            let request = ShelveRequest {
                name,
                comment: comment.unwrap_or_default(),
                commit_dirty: commit,
            };
            session.shelve(request, prompt).await
        }
        Commands::Checkin { comment } => {
            session.checkin(comment.as_deref().unwrap_or_default()).await
        }
        Commands::Unshelve { name, branch, user } => {
            let branch = match branch {
                Some(branch) => branch,
                None => {
                    let list = session.shelvesets(user.as_deref()).await?;
                    match list.iter().find(|s| s.name == name) {
                        Some(shelveset) => session.suggested_branch(shelveset).await?,
                        None => normalize_branch_name(&name),
                    }
                }
            };
            session
                .unshelve(UnshelveRequest { name, branch, user })
                .await
        }
        Commands::Shelvesets { user, url } => {
            for shelveset in session.shelvesets(user.as_deref()).await? {
                let detail = if url {
                    session.shelveset_url(&shelveset.name, &shelveset.owner)?
                } else {
                    shelveset.comment.clone().unwrap_or_default()
                };
                println!(
                    "{}  {}  {}  {}",
                    shelveset.created, shelveset.name, shelveset.owner_display_name, detail
                );
            }
            OperationOutcome::Succeeded
        }
        Commands::Users { pattern } => {
            for user in session.users(pattern.as_deref().unwrap_or_default()).await? {
                println!("{}  ({})", user.name, user.code);
            }
            OperationOutcome::Succeeded
        }
        Commands::Watch => {
            let watcher = session.watch()?;
            print_message(MessageKind::Info, "Watching for changes. Press Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
            watcher.stop().await;
            OperationOutcome::Succeeded
        }
    };
    Ok(outcome.is_succeeded())
}

fn print_info(session: &Session) {
    let snapshot = session.snapshot();
    if let Some(server) = &snapshot.server {
        println!("Workspace:  {} ({})", server.workspace_name, server.workspace.owner);
        println!("Folder:     {}", server.mapped_server_folder);
        if let Some(project) = &server.project {
            println!("Project:    {project}");
        }
    }
    if let Some(repo) = &snapshot.repo {
        println!("Branch:     {}", repo.branch);
        println!("Commits:    {}", repo.non_merge_commit_count);
        println!("Changes:    {}", repo.uncommitted_files);
        if repo.conflict_count > 0 {
            println!("Conflicts:  {}", repo.conflict_count);
        }
        if let Some(message) = repo.latest_commit_message() {
            println!("Last:       {message}");
        }
    }
}

/// Print bus messages until every sender is gone.
async fn print_events(mut rx: broadcast::Receiver<Event>) {
    loop {
        match rx.recv().await {
            Ok(Event::Log(message)) => print_message(message.kind, &message.text),
            Ok(Event::ShelvesetPending(data)) => {
                if let Err(err) = try_set_system_clipboard(&data.name) {
                    tracing::debug!(error = %err, "clipboard unavailable");
                } else {
                    print_message(MessageKind::Info, "Shelveset name is copied to clipboard");
                }
            }
            Ok(Event::ShelvesetCreated(data)) => print_message(
                MessageKind::Success,
                &format!("Shelveset {} is created", data.name),
            ),
            Ok(Event::Outcome(_) | Event::Finished | Event::Snapshot(_)) => {}
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "event printer fell behind");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

fn print_message(kind: MessageKind, text: &str) {
    let color = match kind {
        MessageKind::Info => Color::Reset,
        MessageKind::Success => Color::Green,
        MessageKind::Warning => Color::Yellow,
        MessageKind::Error => Color::Red,
    };
    let mut out = io::stdout();
    let _ = execute!(
        out,
        SetForegroundColor(color),
        Print(text),
        ResetColor,
        Print("\n")
    );
}

fn try_set_system_clipboard(text: &str) -> std::result::Result<(), String> {
    let mut cb = Clipboard::new().map_err(|e| e.to_string())?;
    cb.set_text(text.to_string()).map_err(|e| e.to_string())
}

struct ConsolePrompt {
    assume_yes: bool,
}

impl Prompt for ConsolePrompt {
    fn confirm(&self, question: &str) -> bool {
        if self.assume_yes {
            return true;
        }
        tokio::task::block_in_place(|| {
            let mut out = io::stdout();
            let _ = execute!(
                out,
                SetForegroundColor(Color::Cyan),
                Print(format!("{question} [y/N] ")),
                ResetColor
            );
            let _ = out.flush();
            let mut answer = String::new();
            if io::stdin().lock().read_line(&mut answer).is_err() {
                return false;
            }
            matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
        })
    }
}
