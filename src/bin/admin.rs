use std::collections::VecDeque;

use uuid::Uuid;

use stateset_ledger_sync::config::DEFAULT_DATABASE_URL;
use stateset_ledger_sync::infra::sqlite::{self, SqliteMirrorStore, SqliteTransactionLog};
use stateset_ledger_sync::infra::{MirrorStore, TransactionLog};
use stateset_ledger_sync::{EntityKey, EntityType, TenantId};

fn print_help() {
    eprintln!(
        "\
ledger-sync-admin

USAGE:
  ledger-sync-admin <command> [options]

COMMANDS:
  migrate                         Create the database and run migrations
  show-log                        Print transaction log entries as NDJSON
  show-mirror                     Print one mirror record as JSON
  list-stale                      List mirror records older than a bound

COMMON OPTIONS:
  --database-url <sqlite_url>     (defaults to env DATABASE_URL)

show-log OPTIONS:
  --tenant-id <uuid>              (required)
  --entity-type <type>            (optional; requires --entity-id)
  --entity-id <id>                (optional; requires --entity-type)
  --operation <name>              (optional; requires --idempotency-key)
  --idempotency-key <key>         (optional; requires --operation)
  --after-id <n>                  (default: 0)
  --limit <n>                     (default: 100)

show-mirror OPTIONS:
  --tenant-id <uuid>              (required)
  --entity-type <type>            (required)
  --entity-id <id>                (required)

list-stale OPTIONS:
  --tenant-id <uuid>              (required)
  --older-than-secs <n>           (default: 86400)
  --limit <n>                     (default: 100)
"
    );
}

fn require_database_url(database_url: Option<String>) -> String {
    database_url
        .or_else(|| std::env::var("DATABASE_URL").ok())
        .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string())
}

fn take_value(args: &mut VecDeque<String>, flag: &str) -> anyhow::Result<String> {
    args.pop_front()
        .ok_or_else(|| anyhow::anyhow!("missing value for {flag}"))
}

fn parse_tenant(raw: &str) -> anyhow::Result<TenantId> {
    Ok(TenantId::from_uuid(Uuid::parse_str(raw)?))
}

fn require_tenant(tenant_id: Option<TenantId>) -> anyhow::Result<TenantId> {
    tenant_id.ok_or_else(|| anyhow::anyhow!("--tenant-id is required"))
}

async fn show_log(mut args: VecDeque<String>) -> anyhow::Result<()> {
    let mut database_url: Option<String> = None;
    let mut tenant_id: Option<TenantId> = None;
    let mut entity_type: Option<String> = None;
    let mut entity_id: Option<String> = None;
    let mut operation: Option<String> = None;
    let mut idempotency_key: Option<String> = None;
    let mut after_id: i64 = 0;
    let mut limit: usize = 100;

    while let Some(arg) = args.pop_front() {
        match arg.as_str() {
            "--database-url" => database_url = Some(take_value(&mut args, &arg)?),
            "--tenant-id" => tenant_id = Some(parse_tenant(&take_value(&mut args, &arg)?)?),
            "--entity-type" => entity_type = Some(take_value(&mut args, &arg)?),
            "--entity-id" => entity_id = Some(take_value(&mut args, &arg)?),
            "--operation" => operation = Some(take_value(&mut args, &arg)?),
            "--idempotency-key" => idempotency_key = Some(take_value(&mut args, &arg)?),
            "--after-id" => after_id = take_value(&mut args, &arg)?.parse()?,
            "--limit" => limit = take_value(&mut args, &arg)?.parse()?,
            "-h" | "--help" => {
                print_help();
                return Ok(());
            }
            other => anyhow::bail!("unexpected argument: {other}"),
        }
    }

    let tenant_id = require_tenant(tenant_id)?;
    let pool = sqlite::connect(&require_database_url(database_url), 1).await?;
    let log = SqliteTransactionLog::new(pool);

    let entries = match (entity_type, entity_id, operation, idempotency_key) {
        (Some(entity_type), Some(entity_id), None, None) => {
            log.read_entity(&EntityKey::new(tenant_id, EntityType::new(entity_type), entity_id))
                .await?
        }
        (None, None, Some(operation), Some(key)) => {
            log.read_by_key(&tenant_id, &operation, &key).await?
        }
        (None, None, None, None) => log.read_tenant(&tenant_id, after_id, limit).await?,
        _ => anyhow::bail!(
            "use either --entity-type with --entity-id, or --operation with --idempotency-key"
        ),
    };

    for entry in entries {
        println!("{}", serde_json::to_string(&entry)?);
    }
    Ok(())
}

async fn show_mirror(mut args: VecDeque<String>) -> anyhow::Result<()> {
    let mut database_url: Option<String> = None;
    let mut tenant_id: Option<TenantId> = None;
    let mut entity_type: Option<String> = None;
    let mut entity_id: Option<String> = None;

    while let Some(arg) = args.pop_front() {
        match arg.as_str() {
            "--database-url" => database_url = Some(take_value(&mut args, &arg)?),
            "--tenant-id" => tenant_id = Some(parse_tenant(&take_value(&mut args, &arg)?)?),
            "--entity-type" => entity_type = Some(take_value(&mut args, &arg)?),
            "--entity-id" => entity_id = Some(take_value(&mut args, &arg)?),
            "-h" | "--help" => {
                print_help();
                return Ok(());
            }
            other => anyhow::bail!("unexpected argument: {other}"),
        }
    }

    let tenant_id = require_tenant(tenant_id)?;
    let entity_type =
        entity_type.ok_or_else(|| anyhow::anyhow!("--entity-type is required"))?;
    let entity_id = entity_id.ok_or_else(|| anyhow::anyhow!("--entity-id is required"))?;

    let pool = sqlite::connect(&require_database_url(database_url), 1).await?;
    let mirror = SqliteMirrorStore::new(pool);
    let key = EntityKey::new(tenant_id, EntityType::new(entity_type), entity_id);

    match mirror.get(&key).await? {
        Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
        None => anyhow::bail!("no mirror record for {key}"),
    }
    Ok(())
}

async fn list_stale(mut args: VecDeque<String>) -> anyhow::Result<()> {
    let mut database_url: Option<String> = None;
    let mut tenant_id: Option<TenantId> = None;
    let mut older_than_secs: i64 = 86_400;
    let mut limit: usize = 100;

    while let Some(arg) = args.pop_front() {
        match arg.as_str() {
            "--database-url" => database_url = Some(take_value(&mut args, &arg)?),
            "--tenant-id" => tenant_id = Some(parse_tenant(&take_value(&mut args, &arg)?)?),
            "--older-than-secs" => older_than_secs = take_value(&mut args, &arg)?.parse()?,
            "--limit" => limit = take_value(&mut args, &arg)?.parse()?,
            "-h" | "--help" => {
                print_help();
                return Ok(());
            }
            other => anyhow::bail!("unexpected argument: {other}"),
        }
    }

    let tenant_id = require_tenant(tenant_id)?;
    let pool = sqlite::connect(&require_database_url(database_url), 1).await?;
    let mirror = SqliteMirrorStore::new(pool);
    let cutoff = chrono::Utc::now() - chrono::Duration::seconds(older_than_secs);

    let records = mirror.list_stale(&tenant_id, cutoff, limit).await?;
    eprintln!("{} record(s) last synced before {}", records.len(), cutoff.to_rfc3339());
    for record in records {
        println!(
            "{}\t{}\t{}\tprovisional={}\tdrift_flagged={}",
            record.entity_type,
            record.entity_id,
            record.last_synced_at.to_rfc3339(),
            record.provisional,
            record.drift_flagged
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut args: VecDeque<String> = std::env::args().skip(1).collect();
    let Some(command) = args.pop_front() else {
        print_help();
        return Ok(());
    };

    if matches!(command.as_str(), "-h" | "--help" | "help") {
        print_help();
        return Ok(());
    }

    match command.as_str() {
        "migrate" => {
            let mut database_url: Option<String> = None;
            while let Some(arg) = args.pop_front() {
                match arg.as_str() {
                    "--database-url" => database_url = Some(take_value(&mut args, &arg)?),
                    "-h" | "--help" => {
                        print_help();
                        return Ok(());
                    }
                    other => anyhow::bail!("unexpected argument: {other}"),
                }
            }

            // connect() applies pending migrations
            sqlite::connect(&require_database_url(database_url), 1).await?;
            println!("ok: migrations applied");
            Ok(())
        }
        "show-log" => show_log(args).await,
        "show-mirror" => show_mirror(args).await,
        "list-stale" => list_stale(args).await,
        other => {
            print_help();
            anyhow::bail!("unknown command: {other}")
        }
    }
}
