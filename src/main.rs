use anyhow::{bail, Context, Result};
use std::path::PathBuf;

use facestore::{logging, Config, DataType, ExportFormat, FaceStore};

/// Command line options
struct Args {
    config_path: Option<PathBuf>,
    db_path: Option<PathBuf>,
    command: Command,
}

enum Command {
    Stats,
    UsersList,
    UsersAdd { name: String, email: Option<String> },
    History { limit: Option<i64> },
    Show { analysis_id: i64 },
    Search { analysis_id: i64, threshold: Option<f64>, limit: Option<i64> },
    Export { path: PathBuf, data_type: DataType, csv: bool },
    Clear { confirm: bool },
    Optimize,
}

fn usage_error(message: impl std::fmt::Display) -> ! {
    eprintln!("Error: {}", message);
    eprintln!("Run 'facestore --help' for usage.");
    std::process::exit(2);
}

fn parse_value<T: std::str::FromStr>(flag: &str, value: Option<&String>) -> T {
    match value.map(|v| v.parse::<T>()) {
        Some(Ok(v)) => v,
        Some(Err(_)) => usage_error(format!("invalid value for {}", flag)),
        None => usage_error(format!("{} requires a value", flag)),
    }
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = None;
    let mut db_path = None;
    let mut rest = Vec::new();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("facestore {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--config" | "-c" => {
                config_path = Some(parse_value::<PathBuf>("--config", args.get(i + 1)));
                i += 1;
            }
            "--db" => {
                db_path = Some(parse_value::<PathBuf>("--db", args.get(i + 1)));
                i += 1;
            }
            _ => rest.push(args[i].clone()),
        }
        i += 1;
    }

    Args {
        config_path,
        db_path,
        command: parse_command(&rest),
    }
}

fn parse_command(args: &[String]) -> Command {
    let Some(name) = args.first() else {
        usage_error("no command given");
    };
    let rest = &args[1..];

    match name.as_str() {
        "stats" => Command::Stats,
        "users" => match rest.first().map(String::as_str) {
            Some("list") | None => Command::UsersList,
            Some("add") => {
                let Some(name) = rest.get(1) else {
                    usage_error("users add requires a NAME");
                };
                Command::UsersAdd {
                    name: name.clone(),
                    email: rest.get(2).cloned(),
                }
            }
            Some(other) => usage_error(format!("unknown users subcommand: {}", other)),
        },
        "history" => Command::History {
            limit: rest.first().map(|_| parse_value("LIMIT", rest.first())),
        },
        "show" => Command::Show {
            analysis_id: parse_value("ANALYSIS_ID", rest.first()),
        },
        "search" => {
            let analysis_id = parse_value("ANALYSIS_ID", rest.first());
            let mut threshold = None;
            let mut limit = None;
            let mut i = 1;
            while i < rest.len() {
                match rest[i].as_str() {
                    "--threshold" => {
                        threshold = Some(parse_value("--threshold", rest.get(i + 1)));
                        i += 1;
                    }
                    "--limit" => {
                        limit = Some(parse_value("--limit", rest.get(i + 1)));
                        i += 1;
                    }
                    other => usage_error(format!("unknown search option: {}", other)),
                }
                i += 1;
            }
            Command::Search { analysis_id, threshold, limit }
        }
        "export" => {
            let path = parse_value::<PathBuf>("PATH", rest.first());
            let mut data_type = DataType::All;
            let mut csv = false;
            for arg in &rest[1..] {
                if arg == "--csv" {
                    csv = true;
                } else {
                    data_type = match arg.parse() {
                        Ok(t) => t,
                        Err(e) => usage_error(e),
                    };
                }
            }
            Command::Export { path, data_type, csv }
        }
        "clear" => Command::Clear {
            confirm: rest.iter().any(|a| a == "--yes" || a == "-y"),
        },
        "optimize" => Command::Optimize,
        other => usage_error(format!("unknown command: {}", other)),
    }
}

fn print_help() {
    println!(
        r#"facestore - local face analysis record store

USAGE:
    facestore [OPTIONS] <COMMAND>

COMMANDS:
    stats                                   Show record counts and database size
    users list                              List users
    users add NAME [EMAIL]                  Add a user
    history [LIMIT]                         Show recent verifications
    show ANALYSIS_ID                        Show one analysis and its embedding
    search ANALYSIS_ID [--threshold T] [--limit N]
                                            Find faces similar to an analysis
    export PATH [users|analyses|verifications|all] [--csv]
                                            Export records to a file
    clear --yes                             Delete every record
    optimize                                Compact the database file

OPTIONS:
    --db PATH           Database file (overrides config)
    --config, -c PATH   Path to config file
    --version, -V       Show version
    --help, -h          Show this help message

ENVIRONMENT:
    FACESTORE_CONFIG    Path to config file (overrides default location)
    FACESTORE_LOG       Log level (trace, debug, info, warn, error)

Config file location: $XDG_CONFIG_HOME/facestore/config.toml"#
    );
}

fn main() -> Result<()> {
    let args = parse_args();

    let config = match &args.config_path {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    if let Err(e) = logging::init(config.log_dir.clone()) {
        eprintln!("Warning: logging disabled: {:#}", e);
    }

    let db_path = args.db_path.clone().unwrap_or_else(|| config.db_path.clone());
    let store = FaceStore::open(&db_path)
        .with_context(|| format!("Failed to open face store at {:?}", db_path))?;

    run(&store, &config, args.command)?;
    store.close()?;
    Ok(())
}

fn run(store: &FaceStore, config: &Config, command: Command) -> Result<()> {
    match command {
        Command::Stats => {
            let stats = store.get_database_stats()?;
            println!("Users:              {}", stats.user_count);
            println!("Analyses:           {}", stats.analysis_count);
            println!("  last 7 days:      {}", stats.recent_analyses_7days);
            println!("Embeddings:         {}", stats.embedding_count);
            println!("Verifications:      {}", stats.verification_count);
            println!("Database size:      {}", format_size(stats.db_size_bytes));
            match stats.last_activity_timestamp {
                Some(ts) => println!("Last activity:      {}", ts.to_rfc3339()),
                None => println!("Last activity:      never"),
            }
        }
        Command::UsersList => {
            for user in store.list_users()? {
                println!(
                    "{:>5}  {:<24} {}",
                    user.id,
                    user.name,
                    user.email.as_deref().unwrap_or("-")
                );
            }
        }
        Command::UsersAdd { name, email } => {
            let id = store.add_user(&name, email.as_deref())?;
            println!("Added user {} ({})", id, name);
        }
        Command::History { limit } => {
            let history = store.get_verification_history(limit.unwrap_or(config.history.limit))?;
            if history.is_empty() {
                println!("No verifications recorded");
            }
            for v in history {
                println!(
                    "{:>5}  {}  {:<8} score {:.4} (threshold {:.2})  {} <-> {}",
                    v.id,
                    v.created_at.format("%Y-%m-%d %H:%M:%S"),
                    if v.verified { "MATCH" } else { "NO MATCH" },
                    v.similarity_score,
                    v.threshold_used,
                    v.image1_path,
                    v.image2_path
                );
            }
        }
        Command::Show { analysis_id } => {
            let Some(analysis) = store.get_analysis(analysis_id)? else {
                bail!("analysis {} does not exist", analysis_id);
            };
            println!("{}", serde_json::to_string_pretty(&analysis)?);
            match store.get_embedding_by_analysis_id(analysis_id)? {
                Some(embedding) => println!(
                    "Embedding {}: {} dimensions",
                    embedding.id,
                    embedding.embedding.len()
                ),
                None => println!("No embedding stored"),
            }
        }
        Command::Search { analysis_id, threshold, limit } => {
            let Some(target) = store.get_embedding_by_analysis_id(analysis_id)? else {
                bail!("analysis {} has no stored embedding", analysis_id);
            };
            let threshold = threshold.unwrap_or(config.search.threshold);
            let limit = limit.unwrap_or(config.search.limit);

            // One extra so the query's own analysis can be dropped
            let matches = store.search_similar_faces(&target.embedding, threshold, limit.saturating_add(1))?;
            let matches: Vec<_> = matches
                .into_iter()
                .filter(|m| m.analysis.id != analysis_id)
                .take(limit.max(0) as usize)
                .collect();

            if matches.is_empty() {
                println!("No faces with similarity >= {:.2}", threshold);
            }
            for m in matches {
                println!(
                    "{:>5}  {:.4}  {}  {}",
                    m.analysis.id,
                    m.similarity,
                    m.analysis.user_name.as_deref().unwrap_or("-"),
                    m.analysis.image_path
                );
            }
        }
        Command::Export { path, data_type, csv } => {
            let format = if csv { ExportFormat::Csv } else { config.export.format };
            let written = store.export_data(&path, data_type, format)?;
            println!("Exported {} as {} to {}", data_type, format.name(), written.display());
        }
        Command::Clear { confirm } => {
            store
                .clear_database(confirm)
                .context("Pass --yes to clear the database")?;
            println!("Cleared all records");
        }
        Command::Optimize => {
            store.optimize()?;
            println!("Database optimized");
        }
    }

    Ok(())
}

fn format_size(size: i64) -> String {
    const KB: i64 = 1024;
    const MB: i64 = KB * 1024;
    const GB: i64 = MB * 1024;

    if size >= GB {
        format!("{:.1} GB", size as f64 / GB as f64)
    } else if size >= MB {
        format!("{:.1} MB", size as f64 / MB as f64)
    } else if size >= KB {
        format!("{:.1} KB", size as f64 / KB as f64)
    } else {
        format!("{} bytes", size)
    }
}
