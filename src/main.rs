// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use patchstack::{PatchStore, RestoreOutcome, WorkingCheckout};

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use indicatif::ProgressBar;
use std::{path::PathBuf, process::exit};
use tracing::error;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Parser)]
#[command(
    about,
    override_usage = "\n  patchstack [options] <command>",
    subcommand_help_heading = "Commands",
    version
)]
struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    fn run(self) -> Result<()> {
        match self.command {
            Command::Init(opts) => run_init(opts),
            Command::Link(opts) => run_link(opts),
            Command::Unlink => run_unlink(),
            Command::Status => run_status(),
            Command::Save(opts) => run_save(opts),
            Command::Rollback => run_rollback(),
            Command::Restore => run_restore(),
            Command::Resolve => run_resolve(),
            Command::Skip => run_skip(),
            Command::Abort => run_abort(),
            Command::Check => run_check(),
            Command::Graph => run_graph(),
        }
    }
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Initialize a new patch store.
    #[command(override_usage = "patchstack init [options] <path>")]
    Init(InitOptions),

    /// Link this checkout to a patch store.
    #[command(override_usage = "patchstack link [options] <path>")]
    Link(LinkOptions),

    /// Remove the link to the patch store.
    Unlink,

    /// Show the linked store and which patches are applied.
    Status,

    /// Capture commits into the store and reapply the series.
    #[command(override_usage = "patchstack save [options]")]
    Save(SaveOptions),

    /// Reset the checkout to pure upstream, unapplying every patch.
    Rollback,

    /// Apply every unapplied patch in series order.
    Restore,

    /// Resume after hand-resolving a conflicted patch.
    Resolve,

    /// Drop the conflicted patch and resume.
    Skip,

    /// Abandon the in-progress application and restore the previous HEAD.
    Abort,

    /// Cross-check the series manifest against the store's patch files.
    Check,

    /// Render the series dependency graph as Graphviz DOT.
    Graph,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct InitOptions {
    /// Directory to create the patch store in.
    #[arg(value_name = "path")]
    pub path: PathBuf,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct LinkOptions {
    /// Path to an existing patch store. Supports ~ and $VAR expansion.
    #[arg(value_name = "path")]
    pub path: String,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct SaveOptions {
    /// Capture only commits above this revision instead of the whole stack.
    #[arg(short, long, value_name = "revision")]
    pub since: Option<String>,

    /// Place newly captured patches under a store subdirectory.
    #[arg(short, long, value_name = "directory")]
    pub prefix: Option<String>,
}

fn main() {
    let layer = fmt::layer().compact();
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();
    tracing_subscriber::registry().with(layer).with(filter).init();

    if let Err(error) = run() {
        error!("{error:?}");
        exit(1);
    }

    exit(0)
}

fn run() -> Result<()> {
    Cli::parse().run()
}

fn run_init(opts: InitOptions) -> Result<()> {
    let store = PatchStore::init(&opts.path)?;
    println!("initialized empty patch store at {}", store.root().display());
    Ok(())
}

fn run_link(opts: LinkOptions) -> Result<()> {
    WorkingCheckout::discover(".")?.link(&opts.path)?;
    Ok(())
}

fn run_unlink() -> Result<()> {
    WorkingCheckout::discover(".")?.unlink()?;
    Ok(())
}

fn run_status() -> Result<()> {
    let status = WorkingCheckout::discover(".")?.status()?;
    print!("{status}");
    Ok(())
}

fn run_save(opts: SaveOptions) -> Result<()> {
    let checkout = WorkingCheckout::discover(".")?;
    let (stats, outcome) = checkout.save(
        opts.since.as_deref(),
        opts.prefix.as_deref(),
        ProgressBar::new(0),
    )?;

    println!(
        "saved patches: {} added, {} updated, {} removed",
        stats.added, stats.updated, stats.removed
    );
    report_outcome(outcome)
}

fn run_rollback() -> Result<()> {
    let upstream = WorkingCheckout::discover(".")?.rollback()?;
    println!("checkout reset to upstream {upstream}");
    Ok(())
}

fn run_restore() -> Result<()> {
    let outcome = WorkingCheckout::discover(".")?.restore(ProgressBar::new(0))?;
    report_outcome(outcome)
}

fn run_resolve() -> Result<()> {
    let outcome = WorkingCheckout::discover(".")?.resolve(ProgressBar::new(0))?;
    report_outcome(outcome)
}

fn run_skip() -> Result<()> {
    let outcome = WorkingCheckout::discover(".")?.skip(ProgressBar::new(0))?;
    report_outcome(outcome)
}

fn run_abort() -> Result<()> {
    WorkingCheckout::discover(".")?.abort()?;
    println!("application aborted; checkout restored");
    Ok(())
}

fn run_check() -> Result<()> {
    let report = WorkingCheckout::discover(".")?.check()?;
    print!("{report}");

    if report.is_fatal() {
        return Err(anyhow!("patch store is inconsistent"));
    }

    Ok(())
}

fn run_graph() -> Result<()> {
    print!("{}", WorkingCheckout::discover(".")?.graph()?);
    Ok(())
}

fn report_outcome(outcome: RestoreOutcome) -> Result<()> {
    match outcome {
        RestoreOutcome::Completed { updated, removed } => {
            if updated > 0 || removed > 0 {
                println!("refreshed patches: {updated} updated, {removed} removed");
            }
            println!("all patches applied");
            Ok(())
        }
        RestoreOutcome::Conflicted { id, three_way } => {
            println!("patch {id} did not apply cleanly");
            if three_way {
                println!("conflict markers are in the working tree");
            } else {
                println!("a three-way merge was not possible; apply the change by hand");
            }
            println!("after fixing, stage the result with `git add`, then run one of:");
            println!("  patchstack resolve   commit the fixed patch and continue");
            println!("  patchstack skip      drop this patch and continue");
            println!("  patchstack abort     undo the whole application");
            Err(anyhow!("patch application stopped on {id}"))
        }
    }
}
