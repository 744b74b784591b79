//! gitdock CLI - manage a set of local git repositories from one place.
//!
//! Every command goes through the operations layer, so the same rules apply
//! as in any other front end: one mutating operation per repository, rollback
//! on failure and snapshots as the only read model.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;

mod app;
mod commands;
mod render;

use app::App;
use commands::{branch, config as config_cmd, history, remote, repo};
use gitdock_ops::Config;

/// gitdock - track, sync and inspect many git repositories.
///
/// Repositories are addressed by id, an unambiguous id prefix or their path.
#[derive(Parser, Debug)]
#[command(
    name = "gd",
    author,
    version,
    about = "gitdock: manage local git repositories and their remotes",
    long_about = None
)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Network timeout in seconds (overrides the configured value)
    #[arg(long, global = true, env = "GITDOCK_TIMEOUT_SECS")]
    timeout: Option<u64>,

    #[command(subcommand)]
    command: Option<Commands>,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
enum Commands {
    /// List managed repositories (default command).
    List,

    /// Start managing an existing repository.
    Import {
        /// Path of the working tree.
        path: PathBuf,
    },

    /// Clone a remote repository and start managing it.
    Clone {
        /// Remote URL.
        url: String,

        /// Target directory (defaults to `<clone_root>/<name>`).
        path: Option<PathBuf>,
    },

    /// Show the current snapshot of one or all repositories.
    Status {
        /// Repository id, id prefix or path; all repositories when omitted.
        repo: Option<String>,

        /// Print snapshots as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Download objects and refs from origin.
    Fetch {
        /// Repository id, id prefix or path; all repositories when omitted.
        repo: Option<String>,
    },

    /// Fetch and merge the upstream of the current branch.
    Pull { repo: String },

    /// Push the current branch to origin.
    Push { repo: String },

    /// Commit changes.
    Commit {
        repo: String,

        /// Commit message.
        #[arg(short, long)]
        message: String,

        /// Paths to commit (every tracked change when omitted).
        paths: Vec<PathBuf>,
    },

    /// Merge a branch or revision into the current branch.
    Merge { repo: String, source: String },

    /// Conclude a conflicted merge after the conflicts were fixed.
    Resolve {
        repo: String,

        /// Message of the merge commit.
        #[arg(short, long, default_value = "Merge")]
        message: String,
    },

    /// Abandon a conflicted merge and restore the pre-merge state.
    AbortMerge { repo: String },

    /// Create or delete local branches.
    #[command(subcommand)]
    Branch(BranchCommands),

    /// Switch to another branch.
    Checkout {
        repo: String,
        branch: String,

        /// Discard uncommitted changes to tracked files.
        #[arg(short, long)]
        force: bool,
    },

    /// Show commit history, newest first.
    Log {
        repo: String,

        /// Revision to start from (defaults to HEAD).
        rev: Option<String>,

        /// Maximum number of commits to show.
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,
    },

    /// Show changes: unstaged by default.
    Diff {
        repo: String,

        /// Compare HEAD with the index instead.
        #[arg(long, conflicts_with = "revisions")]
        staged: bool,

        /// One revision (against HEAD) or two to compare.
        #[arg(num_args = 0..=2)]
        revisions: Vec<String>,

        /// Only list changed files with line counts.
        #[arg(long)]
        stat: bool,
    },

    /// List, create or delete tags.
    #[command(subcommand)]
    Tag(TagCommands),

    /// Save and restore uncommitted changes.
    #[command(subcommand)]
    Stash(StashCommands),

    /// Stop managing a repository.
    Remove {
        repo: String,

        /// Also delete the working tree from disk.
        #[arg(long)]
        delete_files: bool,
    },

    /// Query the hosting service.
    #[command(subcommand)]
    Remote(RemoteCommands),

    /// Manage CLI configuration.
    #[command(subcommand)]
    Config(ConfigCommands),
}

/// Branch subcommands.
#[derive(Subcommand, Debug)]
enum BranchCommands {
    /// Create a branch.
    Create {
        repo: String,
        name: String,

        /// Start point (defaults to HEAD).
        #[arg(long)]
        from: Option<String>,
    },

    /// Delete a branch that is not checked out.
    Delete { repo: String, name: String },
}

/// Tag subcommands.
#[derive(Subcommand, Debug)]
enum TagCommands {
    /// List tags.
    List { repo: String },

    /// Create a tag; annotated when a message is given.
    Create {
        repo: String,
        name: String,

        /// Revision to tag (defaults to HEAD).
        #[arg(long)]
        at: Option<String>,

        /// Tag message.
        #[arg(short, long)]
        message: Option<String>,
    },

    /// Delete a tag.
    Delete { repo: String, name: String },
}

/// Stash subcommands. Entries are addressed by index, 0 being the newest.
#[derive(Subcommand, Debug)]
enum StashCommands {
    /// List stashes.
    List { repo: String },

    /// Stash uncommitted changes.
    Save {
        repo: String,

        /// Stash message.
        #[arg(short, long)]
        message: Option<String>,

        /// Include untracked files.
        #[arg(short = 'u', long)]
        include_untracked: bool,
    },

    /// Apply a stash and keep it.
    Apply {
        repo: String,
        #[arg(default_value_t = 0)]
        index: usize,
    },

    /// Apply a stash and drop it.
    Pop {
        repo: String,
        #[arg(default_value_t = 0)]
        index: usize,
    },

    /// Delete a stash.
    Drop {
        repo: String,
        #[arg(default_value_t = 0)]
        index: usize,
    },
}

/// Hosting-service commands.
#[derive(Subcommand, Debug)]
enum RemoteCommands {
    /// List repositories of a user or organization.
    List {
        /// GitHub user or organization name.
        owner: String,

        /// Follow every page instead of printing only the first.
        #[arg(long)]
        all: bool,
    },

    /// Show hosting metadata for a managed repository.
    Show { repo: String },
}

/// Configuration subcommands.
#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Show current configuration.
    Show,

    /// Get a configuration value.
    Get {
        /// Configuration key.
        key: String,
    },

    /// Set a configuration value.
    Set {
        /// Configuration key.
        key: String,
        /// Configuration value.
        value: String,
    },

    /// Show path to config file.
    Path,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let level = if cli.quiet {
        Level::ERROR
    } else if cli.verbose {
        Level::DEBUG
    } else {
        Level::WARN
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let mut config = Config::load()?;
    let command = cli.command.unwrap_or(Commands::List);

    // Config commands never touch the registry.
    if let Commands::Config(config_cmd_inner) = command {
        return match config_cmd_inner {
            ConfigCommands::Show => config_cmd::show(&config),
            ConfigCommands::Get { key } => config_cmd::get(&config, &key),
            ConfigCommands::Set { key, value } => config_cmd::set(&mut config, &key, &value),
            ConfigCommands::Path => config_cmd::path(),
        };
    }

    // A one-off override; never saved.
    if let Some(secs) = cli.timeout {
        config.set("operation_timeout_secs", &secs.to_string())?;
    }
    gitdock_git::set_transport_timeouts(config.operation_timeout())?;
    let app = App::build(config)?;

    match command {
        Commands::List => repo::list(&app)?,
        Commands::Import { path } => repo::import(&app, &path).await?,
        Commands::Clone { url, path } => repo::clone(&app, &url, path).await?,
        Commands::Status { repo: target, json } => {
            repo::status(&app, target.as_deref(), json).await?
        }
        Commands::Fetch { repo: target } => repo::fetch(&app, target.as_deref()).await?,
        Commands::Pull { repo: target } => repo::pull(&app, &target).await?,
        Commands::Push { repo: target } => repo::push(&app, &target).await?,
        Commands::Commit {
            repo: target,
            message,
            paths,
        } => repo::commit(&app, &target, &message, paths).await?,
        Commands::Merge {
            repo: target,
            source,
        } => repo::merge(&app, &target, &source).await?,
        Commands::Resolve {
            repo: target,
            message,
        } => repo::resolve(&app, &target, &message).await?,
        Commands::AbortMerge { repo: target } => repo::abort_merge(&app, &target).await?,
        Commands::Branch(branch_cmd) => match branch_cmd {
            BranchCommands::Create { repo: target, name, from } => {
                branch::create(&app, &target, &name, from.as_deref()).await?
            }
            BranchCommands::Delete { repo: target, name } => {
                branch::delete(&app, &target, &name).await?
            }
        },
        Commands::Checkout {
            repo: target,
            branch: name,
            force,
        } => branch::checkout(&app, &target, &name, force).await?,
        Commands::Log {
            repo: target,
            rev,
            limit,
        } => history::log(&app, &target, rev.as_deref(), limit).await?,
        Commands::Diff {
            repo: target,
            staged,
            revisions,
            stat,
        } => history::diff(&app, &target, staged, &revisions, stat).await?,
        Commands::Tag(tag_cmd) => match tag_cmd {
            TagCommands::List { repo: target } => history::tag_list(&app, &target).await?,
            TagCommands::Create {
                repo: target,
                name,
                at,
                message,
            } => {
                history::tag_create(&app, &target, &name, at.as_deref(), message.as_deref())
                    .await?
            }
            TagCommands::Delete { repo: target, name } => {
                history::tag_delete(&app, &target, &name).await?
            }
        },
        Commands::Stash(stash_cmd) => match stash_cmd {
            StashCommands::List { repo: target } => history::stash_list(&app, &target).await?,
            StashCommands::Save {
                repo: target,
                message,
                include_untracked,
            } => {
                history::stash_save(&app, &target, message.as_deref(), include_untracked).await?
            }
            StashCommands::Apply { repo: target, index } => {
                history::stash_apply(&app, &target, index, false).await?
            }
            StashCommands::Pop { repo: target, index } => {
                history::stash_apply(&app, &target, index, true).await?
            }
            StashCommands::Drop { repo: target, index } => {
                history::stash_drop(&app, &target, index).await?
            }
        },
        Commands::Remove {
            repo: target,
            delete_files,
        } => repo::remove(&app, &target, delete_files).await?,
        Commands::Remote(remote_cmd) => match remote_cmd {
            RemoteCommands::List { owner, all } => remote::list(&app, &owner, all).await?,
            RemoteCommands::Show { repo: target } => remote::show(&app, &target).await?,
        },
        Commands::Config(_) => {}
    }

    Ok(())
}
