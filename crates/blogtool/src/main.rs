use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use blogtool_core::config::{BlogConfig, load_config};
use blogtool_core::error::{RenumberError, RunPhase};
use blogtool_core::identifiers::{IdentifierMapping, IdentifierSpaceReport, ListingStats, inspect};
use blogtool_core::migrate::{latest_version, migrate_database};
use blogtool_core::recovery::{cleanup_temp_ids, fix_negative_ids};
use blogtool_core::renumber::{
    RenumberOptions, RenumberReport, plan_renumber, render_body_diff, renumber,
    repair_and_renumber,
};
use blogtool_core::revalidate::invalidator_from_config;
use blogtool_core::runtime::{
    BlogLayout, LayoutOverrides, display_path, init_project, layout_status,
};
use blogtool_core::store::{ContentItem, ContentStore, NewArticle, SqliteStore, resolve_post};
use chrono::{DateTime, Utc};
use clap::{Args, CommandFactory, Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Parser)]
#[command(
    name = "blogtool",
    version,
    about = "Blog content store maintenance: article ids, references, and view counters"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    project_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH", help = "Content database file")]
    db: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    overrides: LayoutOverrides,
    diagnostics: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            overrides: LayoutOverrides {
                root: cli.project_root.clone(),
                db: cli.db.clone(),
                config: cli.config.clone(),
            },
            diagnostics: cli.diagnostics,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    Init(InitArgs),
    Status,
    Db(DbArgs),
    Article(ArticleArgs),
    Views(ViewsArgs),
    Ids(IdsArgs),
    #[command(about = "Renumber every article to 1..N in creation order")]
    Renumber(RenumberArgs),
    #[command(name = "fix-negative-ids", about = "Reassign non-positive article ids")]
    FixNegativeIds(JsonArgs),
    #[command(name = "cleanup-temp-ids", about = "Settle articles left in the staging range")]
    CleanupTempIds(JsonArgs),
}

#[derive(Debug, Args)]
struct InitArgs {
    #[arg(long, help = "Overwrite an existing config file")]
    force: bool,
    #[arg(long, help = "Skip writing .blogtool/config.toml")]
    no_config: bool,
}

#[derive(Debug, Args)]
struct JsonArgs {
    #[arg(long, help = "Print the report as JSON")]
    json: bool,
}

#[derive(Debug, Args)]
struct DbArgs {
    #[command(subcommand)]
    command: DbSubcommand,
}

#[derive(Debug, Subcommand)]
enum DbSubcommand {
    Migrate,
    Stats,
}

#[derive(Debug, Args)]
struct ArticleArgs {
    #[command(subcommand)]
    command: ArticleSubcommand,
}

#[derive(Debug, Subcommand)]
enum ArticleSubcommand {
    Add(ArticleAddArgs),
    List(JsonArgs),
    Show {
        #[arg(help = "Numeric id or custom path")]
        target: String,
        #[arg(long)]
        json: bool,
    },
    Delete {
        #[arg(allow_negative_numbers = true)]
        id: i64,
    },
}

#[derive(Debug, Args)]
struct ArticleAddArgs {
    #[arg(long)]
    title: String,
    #[arg(long, conflicts_with = "body_file")]
    body: Option<String>,
    #[arg(long, value_name = "PATH")]
    body_file: Option<PathBuf>,
    #[arg(long)]
    custom_path: Option<String>,
    #[arg(long, value_name = "RFC3339", help = "Creation time; defaults to now")]
    created_at: Option<String>,
    #[arg(long, allow_negative_numbers = true, help = "Explicit id instead of the next free one")]
    id: Option<i64>,
}

#[derive(Debug, Args)]
struct ViewsArgs {
    #[command(subcommand)]
    command: ViewsSubcommand,
}

#[derive(Debug, Subcommand)]
enum ViewsSubcommand {
    Record {
        #[arg(allow_negative_numbers = true)]
        id: i64,
        #[arg(long, help = "Count this view as a new visitor")]
        new_visitor: bool,
    },
    Show {
        #[arg(allow_negative_numbers = true)]
        id: i64,
    },
}

#[derive(Debug, Args)]
struct IdsArgs {
    #[command(subcommand)]
    command: IdsSubcommand,
}

#[derive(Debug, Subcommand)]
enum IdsSubcommand {
    #[command(about = "Classify every id as normal, corrupt, or staging")]
    Inspect(JsonArgs),
    #[command(about = "Listing statistics as shown to operators")]
    Stats(JsonArgs),
}

#[derive(Debug, Args)]
struct RenumberArgs {
    #[arg(long, help = "Show the planned mapping and body diffs without writing")]
    dry_run: bool,
    #[arg(long, conflicts_with = "dry_run", help = "Run both repairs first")]
    repair: bool,
    #[arg(long, help = "Print the report as JSON")]
    json: bool,
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::Init(args)) => run_init(&runtime, args),
        Some(Commands::Status) => run_status(&runtime),
        Some(Commands::Db(DbArgs { command })) => match command {
            DbSubcommand::Migrate => run_db_migrate(&runtime),
            DbSubcommand::Stats => run_db_stats(&runtime),
        },
        Some(Commands::Article(ArticleArgs { command })) => match command {
            ArticleSubcommand::Add(args) => run_article_add(&runtime, args),
            ArticleSubcommand::List(JsonArgs { json }) => run_article_list(&runtime, json),
            ArticleSubcommand::Show { target, json } => run_article_show(&runtime, &target, json),
            ArticleSubcommand::Delete { id } => run_article_delete(&runtime, id),
        },
        Some(Commands::Views(ViewsArgs { command })) => match command {
            ViewsSubcommand::Record { id, new_visitor } => {
                run_views_record(&runtime, id, new_visitor)
            }
            ViewsSubcommand::Show { id } => run_views_show(&runtime, id),
        },
        Some(Commands::Ids(IdsArgs { command })) => match command {
            IdsSubcommand::Inspect(JsonArgs { json }) => run_ids_inspect(&runtime, json),
            IdsSubcommand::Stats(JsonArgs { json }) => run_ids_stats(&runtime, json),
        },
        Some(Commands::Renumber(args)) => run_renumber(&runtime, args),
        Some(Commands::FixNegativeIds(JsonArgs { json })) => run_fix_negative_ids(&runtime, json),
        Some(Commands::CleanupTempIds(JsonArgs { json })) => run_cleanup_temp_ids(&runtime, json),
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("BLOGTOOL_LOG")
        .unwrap_or_else(|_| EnvFilter::new("blogtool=info,blogtool_core=info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn run_init(runtime: &RuntimeOptions, args: InitArgs) -> Result<()> {
    let layout = resolve_layout(runtime)?;
    let report = init_project(&layout, !args.no_config, args.force)?;

    println!("Initialized blogtool project");
    println!("project_root: {}", display_path(&layout.root));
    println!("db_path: {}", display_path(&layout.db_path));
    println!("config_path: {}", display_path(&layout.config_path));
    println!("created_state_dir: {}", format_flag(report.created_state_dir));
    println!("wrote_config: {}", format_flag(report.wrote_config));
    println!("migrations.applied: {}", report.migrations.applied.len());
    println!("schema_version: {}", report.migrations.version);
    print_diagnostics(runtime, &layout);
    Ok(())
}

fn run_status(runtime: &RuntimeOptions) -> Result<()> {
    let layout = resolve_layout(runtime)?;
    let status = layout_status(&layout)?;

    println!("project status");
    println!("project_root: {}", display_path(&layout.root));
    println!("initialized: {}", format_flag(status.initialized));
    println!("db_size_bytes: {}", format_size(status.db_size_bytes));
    println!("config_exists: {}", format_flag(status.config_exists));
    println!(
        "schema_version: {} of {}",
        status.schema.version,
        latest_version()
    );
    println!("schema_pending: {}", status.schema.pending);
    if !status.warnings.is_empty() {
        println!("warnings:");
        for warning in &status.warnings {
            println!("  - {warning}");
        }
    }
    print_diagnostics(runtime, &layout);
    Ok(())
}

fn run_db_migrate(runtime: &RuntimeOptions) -> Result<()> {
    let layout = resolve_layout(runtime)?;
    layout.require_initialized()?;
    let report = migrate_database(&layout.db_path)?;

    println!("db migrate");
    println!("db_path: {}", display_path(&layout.db_path));
    if report.applied.is_empty() {
        println!("applied: <none>");
    }
    for label in &report.applied {
        println!("applied: {label}");
    }
    println!("schema_version: {}", report.version);
    print_diagnostics(runtime, &layout);
    Ok(())
}

fn run_db_stats(runtime: &RuntimeOptions) -> Result<()> {
    let session = open_session(runtime)?;
    let status = layout_status(&session.layout)?;
    let counts = session.store.counts()?;

    println!("db stats");
    println!("db_path: {}", display_path(&session.layout.db_path));
    println!("db_size_bytes: {}", format_size(status.db_size_bytes));
    println!("articles: {}", counts.articles);
    println!("staged_copies: {}", counts.staged_copies);
    println!("view_counters: {}", counts.counters);
    print_diagnostics(runtime, &session.layout);
    Ok(())
}

fn run_article_add(runtime: &RuntimeOptions, args: ArticleAddArgs) -> Result<()> {
    let session = open_session(runtime)?;
    let body = match (&args.body, &args.body_file) {
        (Some(body), _) => body.clone(),
        (None, Some(path)) => fs::read_to_string(path)
            .with_context(|| format!("failed to read body file {}", display_path(path)))?,
        (None, None) => String::new(),
    };
    let created_at = args
        .created_at
        .as_deref()
        .map(parse_timestamp)
        .transpose()?;

    let article = session.store.create_article(&NewArticle {
        title: args.title,
        body,
        custom_path: args.custom_path,
        created_at,
        id: args.id,
    })?;

    println!("article added");
    print_article(&article, false);
    Ok(())
}

fn run_article_list(runtime: &RuntimeOptions, json: bool) -> Result<()> {
    let session = open_session(runtime)?;
    let summaries = session.store.list_summaries()?;
    if json {
        return print_json(&summaries);
    }

    println!("article list");
    println!("articles.count: {}", summaries.len());
    for summary in &summaries {
        println!(
            "article: {} {} ({}){}",
            summary.id,
            summary.title,
            summary.created_at.to_rfc3339(),
            summary
                .custom_path
                .as_deref()
                .map(|path| format!(" path={path}"))
                .unwrap_or_default()
        );
    }
    Ok(())
}

fn run_article_show(runtime: &RuntimeOptions, target: &str, json: bool) -> Result<()> {
    let session = open_session(runtime)?;
    let Some(article) = resolve_post(&session.store, target)? else {
        bail!("article not found: {target}");
    };
    if json {
        return print_json(&article);
    }
    println!("article show");
    print_article(&article, true);
    Ok(())
}

fn run_article_delete(runtime: &RuntimeOptions, id: i64) -> Result<()> {
    let session = open_session(runtime)?;
    if !session.store.delete_article(id)? {
        bail!("article not found: {id}");
    }
    println!("article deleted");
    println!("id: {id}");
    Ok(())
}

fn run_views_record(runtime: &RuntimeOptions, id: i64, new_visitor: bool) -> Result<()> {
    let session = open_session(runtime)?;
    let counter = session.store.record_view(id, new_visitor)?;
    println!("views record");
    println!("article_id: {}", counter.article_id);
    println!("view_count: {}", counter.view_count);
    println!("visitor_count: {}", counter.visitor_count);
    Ok(())
}

fn run_views_show(runtime: &RuntimeOptions, id: i64) -> Result<()> {
    let session = open_session(runtime)?;
    println!("views show");
    println!("article_id: {id}");
    match session.store.load_counter(id)? {
        Some(counter) => {
            println!("view_count: {}", counter.view_count);
            println!("visitor_count: {}", counter.visitor_count);
        }
        None => println!("counter: <none>"),
    }
    Ok(())
}

fn run_ids_inspect(runtime: &RuntimeOptions, json: bool) -> Result<()> {
    let session = open_session(runtime)?;
    let report = inspect(&session.store, session.staging_base)?;
    if json {
        return print_json(&report);
    }

    println!("ids inspect");
    print_space_report(&report);
    print_diagnostics(runtime, &session.layout);
    Ok(())
}

fn run_ids_stats(runtime: &RuntimeOptions, json: bool) -> Result<()> {
    let session = open_session(runtime)?;
    let summaries = session.store.list_summaries()?;
    let stats = ListingStats::from_summaries(&summaries, session.staging_base);
    if json {
        return print_json(&stats);
    }

    println!("ids stats");
    println!("total: {}", stats.total);
    println!("negative: {}", stats.negative);
    println!("staging: {}", stats.staging);
    println!("custom_path: {}", stats.custom_path);
    Ok(())
}

fn run_renumber(runtime: &RuntimeOptions, args: RenumberArgs) -> Result<()> {
    let session = open_session(runtime)?;
    let options = RenumberOptions {
        staging_base: session.staging_base,
    };

    if args.dry_run {
        let plan = plan_renumber(&session.store, options).map_err(annotate_run_error)?;
        if args.json {
            return print_json(&plan);
        }
        println!("renumber plan (dry run)");
        println!("total_articles: {}", plan.total_articles);
        println!("custom_path_articles: {}", plan.custom_path_articles);
        println!("changed_ids: {}", plan.changed_ids);
        println!("updated_references: {}", plan.updated_references);
        println!("updated_bodies: {}", plan.body_edits.len());
        print_mapping(&plan.mapping);
        for edit in &plan.body_edits {
            println!();
            print!("{}", render_body_diff(edit));
        }
        return Ok(());
    }

    let invalidator = invalidator_from_config(&session.config)?;
    if args.repair {
        let report = repair_and_renumber(&session.store, invalidator.as_ref(), options)
            .map_err(annotate_run_error)?;
        if args.json {
            return print_json(&report);
        }
        println!("repair and renumber");
        println!("fixedCount: {}", report.fixed.fixed_count);
        println!("cleanedCount: {}", report.cleaned.cleaned_count);
        println!("finished: {}", report.cleaned.finished);
        print_renumber_report(&report.renumbered);
        return Ok(());
    }

    let report =
        renumber(&session.store, invalidator.as_ref(), options).map_err(annotate_run_error)?;
    if args.json {
        return print_json(&report);
    }
    println!("renumber");
    print_renumber_report(&report);
    Ok(())
}

fn run_fix_negative_ids(runtime: &RuntimeOptions, json: bool) -> Result<()> {
    let session = open_session(runtime)?;
    let report =
        fix_negative_ids(&session.store, session.staging_base).map_err(annotate_run_error)?;
    if json {
        return print_json(&report);
    }
    println!("fix-negative-ids");
    println!("fixedCount: {}", report.fixed_count);
    for entry in &report.reassigned {
        println!("reassigned: {} -> {}", entry.old_id, entry.new_id);
    }
    Ok(())
}

fn run_cleanup_temp_ids(runtime: &RuntimeOptions, json: bool) -> Result<()> {
    let session = open_session(runtime)?;
    let report =
        cleanup_temp_ids(&session.store, session.staging_base).map_err(annotate_run_error)?;
    if json {
        return print_json(&report);
    }
    println!("cleanup-temp-ids");
    println!("cleanedCount: {}", report.cleaned_count);
    println!("discarded_duplicates: {}", report.discarded_duplicates);
    println!("restored: {}", report.restored);
    println!("finished: {}", report.finished);
    if report.finished > 0 {
        println!("hint: run `blogtool renumber` to rewrite references and move view counters");
    }
    for entry in &report.restorations {
        println!("restored: {} -> {}", entry.old_id, entry.new_id);
    }
    Ok(())
}

struct Session {
    layout: BlogLayout,
    config: BlogConfig,
    staging_base: i64,
    store: SqliteStore,
}

fn open_session(runtime: &RuntimeOptions) -> Result<Session> {
    let layout = resolve_layout(runtime)?;
    layout.require_initialized()?;
    let config = load_config(&layout.config_path)?;
    let staging_base = config.staging_base()?;
    let store = SqliteStore::open(&layout.db_path)?;
    tracing::debug!(db = %display_path(store.db_path()), staging_base, "opened content store");
    Ok(Session {
        layout,
        config,
        staging_base,
        store,
    })
}

fn annotate_run_error(error: RenumberError) -> anyhow::Error {
    let hint = match &error {
        RenumberError::PreconditionFailed { .. } => {
            "Run `blogtool ids inspect` to see the affected articles."
        }
        RenumberError::PersistenceFailure {
            phase: RunPhase::Lock | RunPhase::Load,
            ..
        } => "Nothing was written; fix the cause above and retry.",
        RenumberError::PersistenceFailure {
            phase: RunPhase::FixNegative | RunPhase::CleanupStaging,
            ..
        } => "The repair stopped part way; it is safe to run it again.",
        RenumberError::PersistenceFailure { .. } => {
            "The run is journaled; run `blogtool renumber` to resume it, or `blogtool cleanup-temp-ids` to settle the staging range."
        }
        RenumberError::ReferenceRewriteFailure { .. } => {
            "Ids were committed but some bodies were not rewritten; fix the article named above, then run `blogtool renumber` to resume."
        }
    };
    anyhow::Error::new(error).context(hint)
}

fn print_renumber_report(report: &RenumberReport) {
    println!("resumed: {}", format_flag(report.resumed));
    println!("totalArticles: {}", report.total_articles);
    println!("updatedReferences: {}", report.updated_references);
    println!("customPathArticles: {}", report.custom_path_articles);
    println!("updated_bodies: {}", report.updated_bodies);
    println!("rekeyed_counters: {}", report.rekeyed_counters);
    println!("pages_invalidated: {}", format_flag(report.pages_invalidated));
    print_mapping(&report.mapping);
}

fn print_mapping(mapping: &IdentifierMapping) {
    println!("mapping.changed: {}", mapping.changed_count());
    for entry in mapping.entries() {
        if entry.old_id != entry.new_id {
            println!("mapping: {} -> {}", entry.old_id, entry.new_id);
        }
    }
}

fn print_space_report(report: &IdentifierSpaceReport) {
    println!("staging_base: {}", report.staging_base);
    println!("total: {}", report.total);
    println!("normal: {}", report.normal_count);
    println!("corrupt: {}", report.corrupt_count);
    println!("staging: {}", report.staging_count);
    println!("custom_path: {}", report.custom_path_count);
    println!("dense: {}", format_flag(report.is_dense));
    if let Some(phase) = report.interrupted_run {
        println!("interrupted_run: {}", phase.as_str());
        println!("hint: run `blogtool renumber` to finish the interrupted run");
    }
    for item in &report.corrupt_items {
        println!("corrupt.item: {} {}", item.id, item.title);
    }
    for item in &report.staging_items {
        match item.staged_from {
            Some(origin) => {
                println!("staging.item: {} {} (copy of {origin})", item.id, item.title)
            }
            None => println!("staging.item: {} {}", item.id, item.title),
        }
    }
    if !report.is_clean() {
        println!(
            "hint: run `blogtool fix-negative-ids` and `blogtool cleanup-temp-ids` before renumbering"
        );
    }
}

fn print_article(article: &ContentItem, with_body: bool) {
    println!("id: {}", article.id);
    println!("uid: {}", article.uid);
    println!("title: {}", article.title);
    println!(
        "custom_path: {}",
        article.custom_path.as_deref().unwrap_or("<none>")
    );
    println!("created_at: {}", article.created_at.to_rfc3339());
    println!("updated_at: {}", article.updated_at.to_rfc3339());
    if let Some(origin) = article.staged_from {
        println!("staged_from: {origin}");
    }
    if with_body {
        println!("body:");
        println!("{}", article.body);
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_diagnostics(runtime: &RuntimeOptions, layout: &BlogLayout) {
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", layout.describe());
    }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value.trim())
        .map(|timestamp| timestamp.with_timezone(&Utc))
        .with_context(|| format!("invalid RFC 3339 timestamp: {value}"))
}

/// Resolves twice so a project-level `.env` can move the database or config.
fn resolve_layout(runtime: &RuntimeOptions) -> Result<BlogLayout> {
    let initial = BlogLayout::from_process(&runtime.overrides)?;
    let project_env = initial.root.join(".env");
    if project_env.exists() {
        let _ = dotenvy::from_path_override(&project_env);
    }
    BlogLayout::from_process(&runtime.overrides)
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}

fn format_size(value: Option<u64>) -> String {
    value
        .map(|size| size.to_string())
        .unwrap_or_else(|| "n/a".to_string())
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::{Cli, Commands, IdsSubcommand, parse_timestamp};

    #[test]
    fn renumber_flags_parse() {
        let cli = Cli::parse_from(["blogtool", "renumber", "--dry-run", "--json"]);
        match cli.command {
            Some(Commands::Renumber(args)) => {
                assert!(args.dry_run);
                assert!(args.json);
                assert!(!args.repair);
            }
            other => panic!("unexpected command: {other:?}"),
        }
        assert!(Cli::try_parse_from(["blogtool", "renumber", "--dry-run", "--repair"]).is_err());
    }

    #[test]
    fn repair_commands_use_endpoint_names() {
        let cli = Cli::parse_from(["blogtool", "cleanup-temp-ids", "--json"]);
        assert!(matches!(cli.command, Some(Commands::CleanupTempIds(_))));
        let cli = Cli::parse_from(["blogtool", "fix-negative-ids"]);
        assert!(matches!(cli.command, Some(Commands::FixNegativeIds(_))));
        let cli = Cli::parse_from([
            "blogtool",
            "--project-root",
            "/tmp/blog",
            "--db",
            "content.db",
            "ids",
            "stats",
        ]);
        assert_eq!(cli.db.as_deref(), Some(std::path::Path::new("content.db")));
        assert!(matches!(
            cli.command,
            Some(Commands::Ids(super::IdsArgs {
                command: IdsSubcommand::Stats(_)
            }))
        ));
    }

    #[test]
    fn article_add_accepts_negative_ids() {
        let cli = Cli::parse_from(["blogtool", "article", "add", "--title", "T", "--id", "-3"]);
        match cli.command {
            Some(Commands::Article(super::ArticleArgs {
                command: super::ArticleSubcommand::Add(args),
            })) => assert_eq!(args.id, Some(-3)),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn timestamps_are_normalized_to_utc() {
        let parsed = parse_timestamp("2024-03-01T10:00:00+02:00").expect("parse");
        assert_eq!(parsed.to_rfc3339(), "2024-03-01T08:00:00+00:00");
        assert!(parse_timestamp("yesterday").is_err());
    }
}
