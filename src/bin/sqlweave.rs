//! sqlweave: developer CLI
//!
//! Inspect how statements are tokenized and rewritten, or run them against
//! a MySQL database.
//!
//! # Usage
//!
//! ```bash
//! # Show the clause tokens
//! sqlweave tokens "SELECT * FROM users WHERE id = :id"
//!
//! # Show the paginated, sorted rewrite and its count query
//! sqlweave rewrite "SELECT * FROM users ORDER BY id" \
//!     --order-by "email desc" --allow id,email --limit 20
//!
//! # Execute with bindings
//! sqlweave run "SELECT * FROM users WHERE role = :role" --bind role=admin --limit 10
//! ```

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use colored::*;
use serde_json::Value;
use sqlweave::prelude::*;
use sqlweave::sql::{TokenKind, substitute_sql};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sqlweave")]
#[command(version)]
#[command(about = "Paginated, sortable, cache-aware SQL query builder", long_about = None)]
#[command(after_help = "EXAMPLES:
    sqlweave tokens 'SELECT * FROM users WHERE id = :id'
    sqlweave rewrite 'SELECT * FROM users ORDER BY id' --order-by 'email desc' --allow id,email
    sqlweave run 'SELECT * FROM users WHERE role = :role' --bind role=admin --limit 10")]
struct Cli {
    /// Verbose output (debug logging)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the tokens the clause rewriters see
    Tokens {
        /// The SQL statement
        sql: String,
    },
    /// Show the rewritten statement and its derived count query
    Rewrite {
        /// The SQL statement
        sql: String,

        #[command(flatten)]
        shape: Shape,
    },
    /// Execute a statement
    Run(RunArgs),
}

#[derive(Args)]
struct RunArgs {
    /// The SQL statement
    sql: String,

    /// Named bindings (name=value)
    #[arg(short, long)]
    bind: Vec<String>,

    #[command(flatten)]
    shape: Shape,

    /// Cache SELECT results for this many seconds
    #[arg(long)]
    cache_ttl: Option<u64>,

    /// Tables the statement reads or writes (cache versioning)
    #[arg(long, value_delimiter = ',')]
    table: Vec<String>,

    /// Database connection URL
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Config file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(short, long, value_enum, default_value = "table")]
    format: OutputFormat,
}

#[derive(Args, Clone)]
struct Shape {
    /// Requested sort, e.g. "name desc, id"
    #[arg(long)]
    order_by: Option<String>,

    /// Columns the sort may use
    #[arg(long, value_delimiter = ',')]
    allow: Vec<String>,

    /// Page size
    #[arg(long)]
    limit: Option<i64>,

    /// Page offset
    #[arg(long)]
    offset: Option<i64>,
}

impl Shape {
    fn paginates(&self) -> bool {
        self.limit.is_some() || self.offset.is_some()
    }

    fn apply(&self, mut query: Query) -> Query {
        if self.paginates() {
            query = query.paginate(&PageRequest::new(self.limit, self.offset));
        }
        if let Some(order_by) = &self.order_by {
            let request = SortRequest::new(order_by.as_str(), self.allow.iter().cloned());
            query = query.sort(&request);
        }
        query
    }
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = match &cli.command {
        Commands::Tokens { sql } => {
            show_tokens(sql);
            Ok(())
        }
        Commands::Rewrite { sql, shape } => show_rewrite(sql, shape),
        Commands::Run(args) => run(args, cli.verbose).await,
    };

    if let Err(e) = result {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "sqlweave=debug" } else { "sqlweave=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn show_tokens(sql: &str) {
    println!("{} {}", "SQL:".dimmed(), sql.yellow());
    println!();
    println!(
        "{:12} {:6} {:6} {:6} {}",
        "Kind".white().bold(),
        "Start".white().bold(),
        "End".white().bold(),
        "Depth".white().bold(),
        "Text".white().bold()
    );
    println!("{}", "─".repeat(60).dimmed());

    for token in sqlweave::tokenize(sql) {
        let kind = match token.kind {
            TokenKind::Keyword => "keyword".cyan(),
            TokenKind::Identifier => "identifier".normal(),
            TokenKind::Placeholder => "placeholder".yellow(),
        };
        println!(
            "{:12} {:6} {:6} {:6} {}",
            kind,
            token.start,
            token.end,
            token.depth,
            &sql[token.start..token.end]
        );
    }
}

fn show_rewrite(sql: &str, shape: &Shape) -> Result<()> {
    let db = Database::new(Config::load(None)?);
    let query = shape.apply(db.query(sql, Binding::new()));

    println!("{} {}", "Input:".dimmed(), sql.yellow());
    println!("{} {:?}", "Kind:".dimmed(), query.kind());
    println!();
    println!("{}", "Rewritten SQL:".green().bold());
    println!("  {}", query.sql().white());

    if let Some(sort) = query.sort_spec() {
        let shown = match sort.sort.as_deref() {
            Some(sort) => sort,
            None if sort.rejected() => "(rejected)",
            None => "(none)",
        };
        println!("  {} {}", "Sort:".dimmed(), shown.cyan());
    }

    if let Some(page) = query.pagination() {
        println!();
        println!("{}", "Count SQL:".green().bold());
        println!("  {}", query.count_sql().white());
        println!(
            "  {} limit={} offset={}",
            "Page:".dimmed(),
            page.limit.to_string().cyan(),
            page.offset.to_string().cyan()
        );
    }

    Ok(())
}

async fn run(args: &RunArgs, verbose: bool) -> Result<()> {
    let mut cfg = Config::load(args.config.as_deref()).context("loading config")?;
    if let Some(url) = &args.database_url {
        cfg.database_url = Some(url.clone());
    }
    if cfg.database_url.is_none() {
        bail!("No database URL. Use --database-url or set DATABASE_URL");
    }

    let db = Database::connect(cfg).await?;

    let binding = parse_bindings(&args.bind)?;
    let mut query = args.shape.apply(db.query(args.sql.as_str(), binding));
    if args.cache_ttl.is_some() || !args.table.is_empty() {
        let mut spec = CacheSpec::new(args.table.iter().cloned());
        if let Some(ttl) = args.cache_ttl {
            spec = spec.ttl(Duration::from_secs(ttl));
        }
        query = query.cache(spec);
    }

    tracing::debug!(sql = %substitute_sql(query.sql(), query.binding()), "Executing");
    query.execute().await?;

    if query.kind().is_select() {
        let listing = query.get_all()?;
        match args.format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&listing)?),
            OutputFormat::Table => {
                format_table(&listing.data);
                if let Some(page) = listing.pagination {
                    println!(
                        "page {} of {} ({} total)",
                        page.current_page.to_string().cyan(),
                        page.total_pages.to_string().cyan(),
                        page.total.to_string().cyan()
                    );
                }
            }
        }
        if query.from_cache() {
            println!("{}", "(from cache)".dimmed());
        }
    } else {
        let affected = query.affected_rows()?;
        println!("{} {} rows affected", "✓".green(), affected);
    }

    if verbose {
        if let Some(stats) = db.cache_store().and_then(|store| store.stats()) {
            println!(
                "{} {} entries, {} hits, {} misses ({:.1}% hit rate)",
                "Cache:".dimmed(),
                stats.entries,
                stats.hits,
                stats.misses,
                stats.hit_rate()
            );
        }
    }

    Ok(())
}

/// Parse `name=value` pairs, reading values as JSON where they parse.
fn parse_bindings(pairs: &[String]) -> Result<Binding> {
    let mut binding = Binding::new();
    for pair in pairs {
        let Some((name, raw)) = pair.split_once('=') else {
            bail!("binding '{}' is not name=value", pair);
        };
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        binding.insert(name.trim().to_string(), value);
    }
    Ok(binding)
}

fn format_table(rows: &[Row]) {
    if rows.is_empty() {
        println!("{}", "(no results)".dimmed());
        return;
    }

    let columns: Vec<&String> = rows[0].keys().collect();

    let mut widths: HashMap<&String, usize> = columns.iter().map(|c| (*c, c.len())).collect();
    for row in rows {
        for (col, val) in row {
            let len = val_to_string(val).len();
            if let Some(w) = widths.get_mut(col) {
                *w = (*w).max(len);
            }
        }
    }

    let header: Vec<String> = columns
        .iter()
        .map(|c| format!("{:width$}", c, width = widths[*c]))
        .collect();
    println!("{}", header.join(" │ ").white().bold());

    let sep: Vec<String> = columns.iter().map(|c| "─".repeat(widths[*c])).collect();
    println!("{}", sep.join("─┼─").dimmed());

    for row in rows {
        let cells: Vec<String> = columns
            .iter()
            .map(|c| {
                let val = row.get(c.as_str()).map(val_to_string).unwrap_or_default();
                format!("{:width$}", val, width = widths[*c])
            })
            .collect();
        println!("{}", cells.join(" │ "));
    }

    println!();
    println!("{} row(s) returned", rows.len().to_string().cyan());
}

fn val_to_string(val: &Value) -> String {
    match val {
        Value::Null => "NULL".to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
