use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use code_indexer::client::Client;
use code_indexer::config::Config;
use code_indexer::error::Error;
use code_indexer::ops::{IndexReport, QueryReport, RepoContext};
use code_indexer::progress::ProgressFn;
use code_indexer::query::{QueryFilters, QueryOptions};
use code_indexer::{daemon, watch};

const EXIT_OK: u8 = 0;
const EXIT_PARTIAL: u8 = 1;
const EXIT_FATAL: u8 = 2;
const EXIT_NO_MATCH: u8 = 3;

#[derive(Parser)]
#[command(name = "cidx", version, about = "Branch-aware semantic code search")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize .code-indexer configuration in a repository
    Init {
        /// Repository root
        #[arg(default_value = ".")]
        path: String,
        /// Enable the per-repository daemon
        #[arg(long)]
        daemon: bool,
        /// Disable the full-text index
        #[arg(long)]
        no_fts: bool,
    },
    /// Index the working tree of the current branch
    Index {
        /// Repository root
        #[arg(short, long, default_value = ".")]
        root: String,
        /// Clear existing vectors before indexing
        #[arg(long)]
        clear: bool,
    },
    /// Search indexed code (hybrid by default)
    Query {
        /// Query text
        text: String,
        /// Full-text search only
        #[arg(long)]
        fts: bool,
        /// Semantic search only
        #[arg(long)]
        semantic: bool,
        /// Include only these languages (repeatable)
        #[arg(short, long)]
        language: Vec<String>,
        /// Exclude these languages (repeatable)
        #[arg(long)]
        exclude_language: Vec<String>,
        /// Include only paths matching these globs (repeatable)
        #[arg(short, long)]
        path: Vec<String>,
        /// Exclude paths matching these globs (repeatable)
        #[arg(long)]
        exclude_path: Vec<String>,
        /// Fuzzy matching (edit distance 1)
        #[arg(long)]
        fuzzy: bool,
        /// Explicit edit distance (0, 1, or 2)
        #[arg(long, value_parser = clap::value_parser!(u8).range(0..=2))]
        edit_distance: Option<u8>,
        /// Treat the query as a regular expression
        #[arg(long)]
        regex: bool,
        /// Max number of results
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
        /// Minimum semantic score
        #[arg(long)]
        min_score: Option<f32>,
        /// Case-sensitive matching
        #[arg(long)]
        case_sensitive: bool,
        /// Snippet lines per result
        #[arg(long, default_value = "5")]
        snippet_lines: usize,
        /// Output as JSON (for agent consumption)
        #[arg(long)]
        json: bool,
        /// Repository root
        #[arg(short, long, default_value = ".")]
        root: String,
    },
    /// Watch the working tree and apply incremental updates
    Watch {
        #[arg(short, long, default_value = ".")]
        root: String,
    },
    /// Stop a running watch
    WatchStop {
        #[arg(short, long, default_value = ".")]
        root: String,
    },
    /// Clear vector data
    Clean {
        #[arg(short, long, default_value = ".")]
        root: String,
    },
    /// Drop all index data (vectors and FTS)
    CleanData {
        #[arg(short, long, default_value = ".")]
        root: String,
    },
    /// Show index status and statistics
    Status {
        #[arg(short, long, default_value = ".")]
        root: String,
    },
    /// Show daemon liveness and cache statistics
    DaemonStatus {
        #[arg(short, long, default_value = ".")]
        root: String,
    },
    /// Run the daemon in the foreground (spawned by the client)
    #[command(hide = true)]
    DaemonRun {
        #[arg(default_value = ".")]
        root: String,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let code = match cli.command {
        Commands::Init { path, daemon, no_fts } => cmd_init(&path, daemon, no_fts),
        Commands::Index { root, clear } => cmd_index(&root, clear),
        Commands::Query {
            text,
            fts,
            semantic,
            language,
            exclude_language,
            path,
            exclude_path,
            fuzzy,
            edit_distance,
            regex,
            limit,
            min_score,
            case_sensitive,
            snippet_lines,
            json,
            root,
        } => cmd_query(QueryInvocation {
            root,
            text,
            fts,
            semantic,
            language,
            exclude_language,
            path,
            exclude_path,
            fuzzy,
            edit_distance,
            regex,
            limit,
            min_score,
            case_sensitive,
            snippet_lines,
            json,
        }),
        Commands::Watch { root } => cmd_watch(&root),
        Commands::WatchStop { root } => cmd_watch_stop(&root),
        Commands::Clean { root } => cmd_simple(&root, "clean"),
        Commands::CleanData { root } => cmd_simple(&root, "clean_data"),
        Commands::Status { root } => cmd_status(&root),
        Commands::DaemonStatus { root } => cmd_daemon_status(&root),
        Commands::DaemonRun { root } => cmd_daemon_run(&root),
    };
    ExitCode::from(code)
}

fn fatal(err: &Error) -> u8 {
    eprintln!("error: {err}");
    EXIT_FATAL
}

fn cmd_init(path: &str, daemon: bool, no_fts: bool) -> u8 {
    let root = PathBuf::from(path);
    // Reject an existing malformed config instead of clobbering it.
    let mut config = match Config::load(&root) {
        Ok(c) => c,
        Err(e) => return fatal(&e),
    };
    config.daemon.enabled = daemon;
    config.fts.enabled = !no_fts;
    if let Err(e) = config.save(&root) {
        return fatal(&e);
    }
    eprintln!("Initialized .code-indexer in {}", root.display());
    EXIT_OK
}

fn index_progress() -> ProgressFn {
    Box::new(|ev| {
        if ev.is_final() {
            eprintln!("  [{}/{}] {}", ev.current, ev.total, ev.info);
        } else if !ev.path.is_empty() {
            eprintln!(
                "  [{}/{}] {} ({:.1} files/s, {:.0} KB/s, {} threads)",
                ev.current, ev.total, ev.path, ev.files_per_second, ev.kb_per_second, ev.active_threads,
            );
        }
    })
}

fn cmd_index(root: &str, clear: bool) -> u8 {
    let client = match Client::new(Path::new(root)) {
        Ok(c) => c,
        Err(e) => return fatal(&e),
    };
    eprintln!("Indexing {}", client.root().display());

    let result = client.execute("index", json!({ "clear": clear }), Some(index_progress()));
    match result {
        Ok(value) => {
            let report: IndexReport = match serde_json::from_value(value) {
                Ok(r) => r,
                Err(e) => return fatal(&Error::Internal(e.to_string())),
            };
            eprintln!(
                "Done. processed={} skipped={} failed={} chunks={} bytes={}",
                report.files_processed,
                report.files_skipped,
                report.files_failed,
                report.chunks_processed,
                format_bytes(report.total_source_bytes),
            );
            if report.files_failed > 0 { EXIT_PARTIAL } else { EXIT_OK }
        }
        Err(e) => fatal(&e),
    }
}

struct QueryInvocation {
    root: String,
    text: String,
    fts: bool,
    semantic: bool,
    language: Vec<String>,
    exclude_language: Vec<String>,
    path: Vec<String>,
    exclude_path: Vec<String>,
    fuzzy: bool,
    edit_distance: Option<u8>,
    regex: bool,
    limit: usize,
    min_score: Option<f32>,
    case_sensitive: bool,
    snippet_lines: usize,
    json: bool,
}

fn cmd_query(inv: QueryInvocation) -> u8 {
    let client = match Client::new(Path::new(&inv.root)) {
        Ok(c) => c,
        Err(e) => return fatal(&e),
    };

    let method = match (inv.fts, inv.semantic) {
        (true, false) => "query_fts",
        (false, true) => "query_semantic",
        _ => "query_hybrid",
    };

    let filters = QueryFilters {
        languages: inv.language,
        exclude_languages: inv.exclude_language,
        path_filters: inv.path,
        exclude_paths: inv.exclude_path,
        min_score: inv.min_score,
        limit: inv.limit,
    };
    let options = QueryOptions {
        case_sensitive: inv.case_sensitive,
        edit_distance: inv.edit_distance.unwrap_or(u8::from(inv.fuzzy)),
        regex: inv.regex,
        snippet_lines: inv.snippet_lines,
        ..Default::default()
    };

    let args = json!({ "text": inv.text, "filters": filters, "options": options });
    match client.execute(method, args, None) {
        Ok(value) => {
            let report: QueryReport = match serde_json::from_value(value) {
                Ok(r) => r,
                Err(e) => return fatal(&Error::Internal(e.to_string())),
            };
            print_query_report(&report, inv.json);
            if report.results.is_empty() { EXIT_NO_MATCH } else { EXIT_OK }
        }
        Err(e) => fatal(&e),
    }
}

fn print_query_report(report: &QueryReport, as_json: bool) {
    if as_json {
        println!("{}", serde_json::to_string_pretty(&report).unwrap_or_default());
        return;
    }
    if report.fts_missing_warning {
        eprintln!("warning: FTS index missing, showing semantic results only");
    }
    if report.results.is_empty() {
        eprintln!("No results found.");
        return;
    }
    eprintln!("{} result(s) on {}\n", report.results.len(), report.branch);
    for (i, r) in report.results.iter().enumerate() {
        let provenance = match (r.from_semantic, r.from_fts) {
            (true, true) => "hybrid",
            (true, false) => "semantic",
            _ => "fts",
        };
        let symbol = r.symbol.as_deref().map(|s| format!(" {s}")).unwrap_or_default();
        println!("── [{i}] {}:{}{symbol} [{provenance} {:.3}] ──", r.path, r.line, r.score);
        if !r.snippet.is_empty() {
            println!("{}", r.snippet);
        }
        println!();
    }
}

fn cmd_simple(root: &str, method: &str) -> u8 {
    let client = match Client::new(Path::new(root)) {
        Ok(c) => c,
        Err(e) => return fatal(&e),
    };
    match client.execute(method, json!({}), None) {
        Ok(_) => {
            eprintln!("{method} done");
            EXIT_OK
        }
        Err(e) => fatal(&e),
    }
}

fn cmd_status(root: &str) -> u8 {
    let client = match Client::new(Path::new(root)) {
        Ok(c) => c,
        Err(e) => return fatal(&e),
    };
    match client.execute("status", json!({}), None) {
        Ok(value) => {
            println!("Index status for {}", value["root"].as_str().unwrap_or(root));
            println!("  Branch:          {}", value["branch"].as_str().unwrap_or("?"));
            println!("  Points:          {}", value["point_count"]);
            println!("  Visible points:  {}", value["visible_point_count"]);
            println!("  FTS available:   {}", value["fts_available"]);
            println!("  FTS documents:   {}", value["fts_doc_count"]);
            if let Some(langs) = value["languages"].as_object() {
                if !langs.is_empty() {
                    println!("  Languages:");
                    for (lang, count) in langs {
                        println!("    {lang}: {count} chunks");
                    }
                }
            }
            EXIT_OK
        }
        Err(e) => fatal(&e),
    }
}

fn cmd_daemon_status(root: &str) -> u8 {
    let root_path = PathBuf::from(root);
    if !daemon::is_running(&root_path) {
        println!("Daemon: not running");
        return EXIT_OK;
    }
    let client = match Client::new(&root_path) {
        Ok(c) => c,
        Err(e) => return fatal(&e),
    };
    match client.execute("status", json!({}), None) {
        Ok(value) => {
            println!("Daemon: running");
            println!("  Uptime:        {}s", value["daemon_uptime_seconds"]);
            println!("  Cache loaded:  {}", value["cache_loaded"]);
            println!("  Access count:  {}", value["access_count"]);
            println!("  Watch active:  {}", value["watch_active"]);
            EXIT_OK
        }
        Err(e) => fatal(&e),
    }
}

fn cmd_watch(root: &str) -> u8 {
    let client = match Client::new(Path::new(root)) {
        Ok(c) => c,
        Err(e) => return fatal(&e),
    };

    if client.config().daemon.enabled {
        return match client.execute("watch_start", json!({}), None) {
            Ok(_) => {
                eprintln!("Watch started (daemon)");
                EXIT_OK
            }
            Err(e) => fatal(&e),
        };
    }

    // Foreground watch: run until interrupted.
    let ctx = match RepoContext::open_in_process(client.root(), client.config().clone()) {
        Ok(c) => std::sync::Arc::new(c),
        Err(e) => return fatal(&e),
    };
    let handle = match watch::spawn(ctx, watch::DEFAULT_DEBOUNCE) {
        Ok(h) => h,
        Err(e) => return fatal(&e),
    };
    eprintln!("Watching {} (Ctrl-C to stop)", client.root().display());
    while handle.is_running() {
        std::thread::sleep(std::time::Duration::from_millis(500));
    }
    EXIT_OK
}

fn cmd_watch_stop(root: &str) -> u8 {
    let client = match Client::new(Path::new(root)) {
        Ok(c) => c,
        Err(e) => return fatal(&e),
    };
    if !client.config().daemon.enabled {
        eprintln!("No daemon configured; foreground watches stop with Ctrl-C");
        return EXIT_OK;
    }
    match client.execute("watch_stop", json!({}), None) {
        Ok(value) => {
            if value["stopped"].as_bool().unwrap_or(false) {
                eprintln!("Watch stopped");
            } else {
                eprintln!("No watch was running");
            }
            EXIT_OK
        }
        Err(e) => fatal(&e),
    }
}

fn cmd_daemon_run(root: &str) -> u8 {
    match daemon::run(Path::new(root)) {
        Ok(()) => EXIT_OK,
        Err(e) => fatal(&e),
    }
}

fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;
    match bytes {
        b if b >= GB => format!("{:.1} GB", b as f64 / GB as f64),
        b if b >= MB => format!("{:.1} MB", b as f64 / MB as f64),
        b if b >= KB => format!("{:.1} KB", b as f64 / KB as f64),
        b => format!("{b} B"),
    }
}
