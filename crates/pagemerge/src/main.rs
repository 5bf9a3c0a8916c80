use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, CommandFactory, Parser, Subcommand};
use pagemerge_core::anchor::{AnchorRegion, locate_region};
use pagemerge_core::attachments::AttachmentPlan;
use pagemerge_core::comments::CommentMetadata;
use pagemerge_core::config::{DEFAULT_CONFIG_PATH, load_config};
use pagemerge_core::error::MergeWarning;
use pagemerge_core::fingerprint::{Fingerprint, canonical_form};
use pagemerge_core::markup::DocumentTree;
use pagemerge_core::merge::CommentOp;
use pagemerge_core::pipeline::{MergeOptions, MergeOutcome, PageInput, RemoteSnapshot, merge_page};
use pagemerge_core::publish::{PublishOptions, publish_pages};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "pagemerge",
    version,
    about = "Merge rendered storage-format fragments into live Confluence pages"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    project_root: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Merge a fragment into a saved page body and print the result as JSON")]
    Merge(MergeArgs),
    #[command(about = "Print the change fingerprint of a fragment")]
    Fingerprint(FingerprintArgs),
    #[command(about = "Show which region of a page body would be replaced")]
    Anchors(AnchorsArgs),
    #[command(about = "Publish every configured page")]
    Publish(PublishArgs),
}

#[derive(Debug, Args)]
struct MergeArgs {
    #[arg(long, value_name = "PATH", help = "Current page body; omit for a new page")]
    remote: Option<PathBuf>,
    #[arg(long, value_name = "PATH")]
    fragment: PathBuf,
    #[arg(long)]
    title: String,
    #[arg(long, value_name = "PATH", help = "JSON array of inline comment metadata")]
    comments: Option<PathBuf>,
    #[arg(long, value_name = "HEX", help = "Fingerprint stored on the remote page")]
    stored_fingerprint: Option<String>,
    #[arg(long, help = "Drop inline comments instead of restoring them")]
    no_restore_comments: bool,
    #[arg(long, help = "Delete comments whose anchor text disappeared")]
    resolve_if_changed: bool,
}

#[derive(Debug, Args)]
struct FingerprintArgs {
    #[arg(long, value_name = "PATH")]
    fragment: PathBuf,
    #[arg(long)]
    title: String,
    #[arg(long, help = "Also print the canonical form that was hashed")]
    canonical: bool,
}

#[derive(Debug, Args)]
struct AnchorsArgs {
    #[arg(value_name = "PATH")]
    body: PathBuf,
}

#[derive(Debug, Args)]
struct PublishArgs {
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, help = "Merge and diff without writing anything")]
    dry_run: bool,
}

#[derive(Debug, Serialize)]
struct MergeSummary {
    action: &'static str,
    fingerprint: Fingerprint,
    #[serde(skip_serializing_if = "Option::is_none")]
    region: Option<AnchorRegion>,
    #[serde(skip_serializing_if = "Option::is_none")]
    body: Option<String>,
    comment_ops: Vec<CommentOp>,
    attachments: AttachmentPlan,
    warnings: Vec<MergeWarning>,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let root = project_root(cli.project_root.as_deref())?;

    match cli.command {
        Some(Commands::Merge(args)) => run_merge(&root, args),
        Some(Commands::Fingerprint(args)) => run_fingerprint(&root, args),
        Some(Commands::Anchors(args)) => run_anchors(&root, args),
        Some(Commands::Publish(args)) => run_publish(&root, args),
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("pagemerge=info,pagemerge_core=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn project_root(explicit: Option<&Path>) -> Result<PathBuf> {
    dotenvy::dotenv().ok();
    let root = match explicit {
        Some(path) => path.to_path_buf(),
        None => std::env::current_dir().context("failed to resolve current directory")?,
    };
    let project_env = root.join(".env");
    if project_env.exists() {
        let _ = dotenvy::from_path_override(&project_env);
    }
    Ok(root)
}

fn read_file(root: &Path, path: &Path) -> Result<String> {
    let path = root.join(path);
    fs::read_to_string(&path).with_context(|| format!("failed to read {}", normalize_path(&path)))
}

fn run_merge(root: &Path, args: MergeArgs) -> Result<()> {
    let comments: Vec<CommentMetadata> = match &args.comments {
        Some(path) => serde_json::from_str(&read_file(root, path)?)
            .with_context(|| format!("failed to parse comments {}", normalize_path(path)))?,
        None => Vec::new(),
    };
    let remote = RemoteSnapshot {
        body: args
            .remote
            .as_deref()
            .map(|path| read_file(root, path))
            .transpose()?,
        stored_fingerprint: args.stored_fingerprint,
        comments,
        attachments: Vec::new(),
    };
    let input = PageInput {
        title: args.title,
        fragment: read_file(root, &args.fragment)?,
        attachments: Vec::new(),
    };
    let options = MergeOptions {
        restore_comments: !args.no_restore_comments,
        resolve_if_changed: args.resolve_if_changed,
    };

    let summary = match merge_page(&input, &remote, options)? {
        MergeOutcome::Unchanged { fingerprint } => MergeSummary {
            action: "unchanged",
            fingerprint,
            region: None,
            body: None,
            comment_ops: Vec::new(),
            attachments: AttachmentPlan::default(),
            warnings: Vec::new(),
        },
        MergeOutcome::Merged(result) => {
            let body = result.body();
            let result = *result;
            MergeSummary {
                action: "merged",
                fingerprint: result.fingerprint,
                region: Some(result.region),
                body: Some(body),
                comment_ops: result.comment_ops,
                attachments: result.attachments,
                warnings: result.warnings,
            }
        }
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn run_fingerprint(root: &Path, args: FingerprintArgs) -> Result<()> {
    let fragment = DocumentTree::parse(&read_file(root, &args.fragment)?)?;
    println!("{}", Fingerprint::compute(&args.title, &fragment));
    if args.canonical {
        println!("{}", canonical_form(&fragment));
    }
    Ok(())
}

fn run_anchors(root: &Path, args: AnchorsArgs) -> Result<()> {
    let tree = DocumentTree::parse(&read_file(root, &args.body)?)?;
    let resolution = locate_region(&tree);
    println!("{}", serde_json::to_string_pretty(&resolution)?);
    Ok(())
}

fn run_publish(root: &Path, args: PublishArgs) -> Result<()> {
    let config_path = root.join(
        args.config
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH)),
    );
    let config = load_config(&config_path)?;
    if config.pages.is_empty() {
        println!(
            "no [[pages]] configured in {}",
            normalize_path(&config_path)
        );
        return Ok(());
    }

    let options = PublishOptions::from_config(&config, args.dry_run);
    info!(
        pages = config.pages.len(),
        dry_run = options.dry_run,
        config = %normalize_path(&config_path),
        "publishing pages"
    );
    let report = publish_pages(&config, root, &options)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.success {
        anyhow::bail!(
            "publish finished with {} error(s) and {} conflict(s)",
            report.errors.len(),
            report.conflicts.len()
        );
    }
    Ok(())
}

fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}
