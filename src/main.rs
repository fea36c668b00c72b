use anyhow::{bail, Context, Result};
use rusqlite::Connection;
use std::collections::HashSet;
use std::env;
use std::path::Path;

use child_register::{
    load_rows, merge_registrants, persist_outcome, setup_database, ImportKind,
    ReconcileOptions, Reconciler,
};

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();

    match args.get(1).map(String::as_str) {
        Some("import") => run_import(&args[2..]),
        Some("merge") => run_merge(&args[2..]),
        _ => {
            eprintln!("Usage:");
            eprintln!("  child-register import <csv> <db> [--bulk] [--stage-registration]");
            eprintln!("                 [--class-list <id> | --cohort <id> | --immunisation <id>]");
            eprintln!("  child-register merge <db> <keep-id> <discard-id>");
            std::process::exit(1);
        }
    }
}

fn run_import(args: &[String]) -> Result<()> {
    let (csv_path, db_path, options, import) = parse_import_args(args)?;

    println!("🗄️  Child Register Import - CSV → SQLite + WAL");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    println!("\n📂 Loading rows...");
    let rows = load_rows(Path::new(&csv_path))?;
    println!("✓ Loaded {} rows from CSV", rows.len());

    println!("\n🔧 Setting up database...");
    let mut conn = Connection::open(Path::new(&db_path))?;
    setup_database(&conn)?;
    println!("✓ Database initialized with WAL mode");

    println!("\n🔄 Reconciling rows...");
    let reconciler = Reconciler::new(options);
    let mut seen_hashes: HashSet<String> = HashSet::new();
    let mut created = 0usize;
    let mut matched = 0usize;
    let mut held_for_review = 0usize;
    let mut school_moves = 0usize;
    let mut duplicates = 0usize;

    // Rows are processed strictly in order, one transaction per row, so a
    // failure leaves every earlier row committed and the failing row absent.
    for row in &rows {
        if !seen_hashes.insert(row.idempotency_hash()) {
            duplicates += 1;
            continue;
        }

        let mut outcome = reconciler
            .reconcile_row(&conn, row)
            .context("failed to reconcile row")?;

        let tx = conn.transaction()?;
        persist_outcome(&tx, &mut outcome, import)?;
        tx.commit()?;

        if outcome.matched_existing {
            matched += 1;
        } else {
            created += 1;
        }
        if outcome.needs_review() {
            held_for_review += 1;
        }
        if outcome.school_move.is_some() {
            school_moves += 1;
        }
    }

    println!("\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("✅ Import complete!");
    println!("✓ New registrants:    {}", created);
    println!("✓ Matched existing:   {}", matched);
    println!("✓ Held for review:    {}", held_for_review);
    println!("✓ School moves:       {}", school_moves);
    println!("✓ Duplicate rows:     {}", duplicates);

    Ok(())
}

fn run_merge(args: &[String]) -> Result<()> {
    let (db_path, keep_id, discard_id) = match args {
        [db, keep, discard] => (
            db.clone(),
            keep.parse::<i64>().context("keep-id must be an integer")?,
            discard
                .parse::<i64>()
                .context("discard-id must be an integer")?,
        ),
        _ => bail!("usage: child-register merge <db> <keep-id> <discard-id>"),
    };

    println!("🔀 Merging registrant {} into {}", discard_id, keep_id);

    let mut conn = Connection::open(Path::new(&db_path))?;
    setup_database(&conn)?;

    let tx = conn.transaction()?;
    merge_registrants(&tx, keep_id, discard_id)?;
    tx.commit()?;

    println!("✅ Merge complete");
    Ok(())
}

fn parse_import_args(
    args: &[String],
) -> Result<(String, String, ReconcileOptions, Option<(ImportKind, i64)>)> {
    let mut positional: Vec<String> = Vec::new();
    let mut options = ReconcileOptions::default();
    let mut import: Option<(ImportKind, i64)> = None;

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--bulk" => options.bulk_mode = true,
            "--stage-registration" => options.stage_registration = true,
            "--class-list" | "--cohort" | "--immunisation" => {
                let kind = match arg.as_str() {
                    "--class-list" => ImportKind::ClassList,
                    "--cohort" => ImportKind::Cohort,
                    _ => ImportKind::Immunisation,
                };
                let id = iter
                    .next()
                    .with_context(|| format!("{} requires an import id", arg))?
                    .parse::<i64>()
                    .context("import id must be an integer")?;
                import = Some((kind, id));
            }
            other => positional.push(other.to_string()),
        }
    }

    match positional.as_slice() {
        [csv, db] => Ok((csv.clone(), db.clone(), options, import)),
        _ => bail!("usage: child-register import <csv> <db> [flags]"),
    }
}
