use clap::Parser;
use docvault::{
    DataDir,
    DocumentDb,
    TaskContext,
    document::RuleKind,
    error::{self, Error},
    settings::{self, Settings},
    tasks::{self, ConsumeOverrides, ConsumeRequest},
};
use tracing_subscriber::EnvFilter;

mod cli;

use cli::{Cli, Command, ConfigAction, ConsumeArgs, IndexAction, RuleAction};

fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if let Ok(env) = std::env::var("DOCVAULT_LOG") {
        EnvFilter::new(env)
    } else if quiet {
        EnvFilter::new("warn")
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

fn main() -> error::Result<()> {
    let cli = Cli::parse();

    if let Command::Completions(args) = &cli.command {
        args.generate();
        return Ok(());
    }

    init_tracing(cli.verbose, cli.quiet);

    let data_dir = DataDir::resolve(cli.data_dir.as_deref())?;

    // Rule and config commands only need the document database.
    match cli.command {
        Command::Rule { action } => {
            let db = DocumentDb::open(&data_dir.documents_db())?;
            return cmd_rule(&db, action);
        }
        Command::Config { action } => {
            let db = DocumentDb::open(&data_dir.documents_db())?;
            return cmd_config(&db, action);
        }
        command => run_task(TaskContext::open(data_dir)?, command),
    }
}

fn run_task(ctx: TaskContext, command: Command) -> error::Result<()> {
    let result = match command {
        Command::Index { action } => match action {
            IndexAction::Optimize => tasks::index_optimize(&ctx)?,
            IndexAction::Reindex { no_progress_bar } => {
                tasks::index_reindex(&ctx, no_progress_bar)?
            }
        },
        Command::Train => tasks::train_classifier(&ctx)?,
        Command::Consume(args) => {
            tasks::consume_file(&ctx, consume_request(args)?)?
        }
        Command::Sanity => tasks::sanity_check(&ctx)?,
        Command::BulkUpdate { ids } => tasks::bulk_update_documents(&ctx, &ids)?,
        Command::Archive { id } => tasks::update_document_archive_file(&ctx, id)?,
        Command::Repair => tasks::repair_archives(&ctx)?,
        Command::Search(args) => {
            return cmd_search(&ctx, &args.query, args.count, args.json);
        }
        Command::Status(args) => return cmd_status(&ctx, args.json),
        Command::Rule { .. } | Command::Config { .. } | Command::Completions(_) => {
            return Ok(());
        }
    };
    println!("{result}");
    Ok(())
}

fn consume_request(args: ConsumeArgs) -> error::Result<ConsumeRequest> {
    if !args.path.is_file() {
        return Err(Error::Config(format!(
            "not a file: {}",
            args.path.display()
        )));
    }

    let mut request = ConsumeRequest::new(&args.path);
    request.overrides = ConsumeOverrides {
        filename: args.filename,
        title: args.title,
        correspondent_id: args.correspondent,
        document_type_id: args.document_type,
        tag_ids: (!args.tags.is_empty()).then_some(args.tags),
        created: args.created,
    };
    if let Some(task_id) = args.task_id {
        request = request.with_task_id(task_id);
    }
    Ok(request)
}

fn cmd_search(
    ctx: &TaskContext,
    query: &str,
    count: usize,
    json: bool,
) -> error::Result<()> {
    let index = ctx.open_index()?;
    let hits = index.search(query, count)?;

    if json {
        let hits: Vec<_> = hits
            .iter()
            .map(|hit| {
                serde_json::json!({
                    "id": hit.id,
                    "score": hit.score,
                    "title": hit.title,
                    "original_filename": hit.original_filename,
                })
            })
            .collect();
        println!(
            "{}",
            serde_json::json!({ "query": query, "results": hits })
        );
    } else if hits.is_empty() {
        println!("No results for '{query}'");
    } else {
        for hit in &hits {
            println!(
                "{:>7}  {:.3}  {}  ({})",
                hit.id, hit.score, hit.title, hit.original_filename
            );
        }
    }
    Ok(())
}

fn cmd_rule(db: &DocumentDb, action: RuleAction) -> error::Result<()> {
    match action {
        RuleAction::Add {
            kind,
            name,
            algorithm,
        } => {
            let rule = db.add_rule(kind, &name, algorithm)?;
            println!("Added {kind} '{}' with id {}", rule.name, rule.id);
        }
        RuleAction::List { kind, json } => {
            let kinds = match kind {
                Some(kind) => vec![kind],
                None => RuleKind::ALL.to_vec(),
            };
            let mut rules = Vec::new();
            for kind in kinds {
                rules.extend(db.list_rules(kind)?);
            }

            if json {
                println!("{}", serde_json::to_string(&rules)?);
            } else if rules.is_empty() {
                println!("No matching rules defined.");
            } else {
                for rule in &rules {
                    println!(
                        "{}\t{}\t{}\t{}",
                        rule.kind, rule.id, rule.name, rule.matching_algorithm
                    );
                }
            }
        }
        RuleAction::Remove { kind, id } => {
            if !db.remove_rule(kind, id)? {
                return Err(Error::NotFound {
                    kind: "rule",
                    name: format!("{kind} {id}"),
                });
            }
            println!("Removed {kind} {id}");
        }
    }
    Ok(())
}

fn cmd_config(db: &DocumentDb, action: ConfigAction) -> error::Result<()> {
    match action {
        ConfigAction::Get { key } => {
            check_key(&key)?;
            let value = match std::env::var(settings::env_var_name(&key)) {
                Ok(value) => value,
                Err(_) => db.get_setting(&key)?.unwrap_or_default(),
            };
            println!("{value}");
        }
        ConfigAction::Set { key, value } => {
            check_key(&key)?;
            let previous = db.get_setting(&key)?;
            db.set_setting(&key, &value)?;
            // Reject values the task layer could not load.
            if let Err(e) = Settings::load(db) {
                match previous {
                    Some(previous) => db.set_setting(&key, &previous)?,
                    None => {
                        db.remove_setting(&key)?;
                    }
                }
                return Err(e);
            }
            println!("Set {key} = {value}");
        }
        ConfigAction::List { json } => {
            let stored = db.list_settings()?;
            if json {
                let map: serde_json::Map<String, serde_json::Value> = stored
                    .into_iter()
                    .map(|(k, v)| (k, serde_json::Value::String(v)))
                    .collect();
                println!("{}", serde_json::Value::Object(map));
            } else if stored.is_empty() {
                println!("No settings stored.");
            } else {
                for (key, value) in &stored {
                    println!("{key}\t{value}");
                }
            }
        }
        ConfigAction::Clear { key } => {
            check_key(&key)?;
            if db.remove_setting(&key)? {
                println!("Cleared {key}");
            } else {
                println!("{key} was not set");
            }
        }
    }
    Ok(())
}

fn check_key(key: &str) -> error::Result<()> {
    if settings::KNOWN_KEYS.contains(&key) {
        Ok(())
    } else {
        Err(Error::Config(format!(
            "unknown setting '{key}' (known: {})",
            settings::KNOWN_KEYS.join(", ")
        )))
    }
}

fn cmd_status(ctx: &TaskContext, json: bool) -> error::Result<()> {
    let consume_dir = ctx.data_dir.consume_dir()?;
    let documents = ctx.db.document_count()?;
    let indexed = ctx.open_index()?.doc_count()?;
    let mut rules = 0;
    for kind in RuleKind::ALL {
        rules += ctx.db.list_rules(kind)?.len();
    }

    if json {
        println!(
            "{}",
            serde_json::json!({
                "data_dir": ctx.data_dir.root().display().to_string(),
                "consume_dir": consume_dir.display().to_string(),
                "documents": documents,
                "indexed": indexed,
                "rules": rules,
                "barcodes": ctx.settings.enable_barcodes,
            })
        );
    } else {
        println!("Data directory: {}", ctx.data_dir.root().display());
        println!("Consume directory: {}", consume_dir.display());
        println!("Documents: {documents}");
        println!("Indexed: {indexed}");
        println!("Matching rules: {rules}");
        println!(
            "Barcode splitting: {}",
            if ctx.settings.enable_barcodes {
                "enabled"
            } else {
                "disabled"
            }
        );
    }
    Ok(())
}
