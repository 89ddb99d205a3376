use std::path::Path;

use petwash_control::adapters::db::{
    open_connection, run_migrations, schema_version, upsert_station,
};
use petwash_control::domain::models::{ServiceOption, Station, StationCapabilities, StationStatus};

fn main() {
    if let Err(error) = run() {
        eprintln!("failed to create test db: {error}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let mut path = "./data/petwash_test.db".to_string();
    let mut force = false;
    let mut seed_station: Option<String> = None;

    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut index = 0;
    while index < args.len() {
        match args[index].as_str() {
            "--path" => {
                let Some(value) = args.get(index + 1) else {
                    return Err("--path requires a value".to_string());
                };
                path = value.clone();
                index += 2;
            }
            "--force" => {
                force = true;
                index += 1;
            }
            "--seed-demo" => {
                let Some(value) = args.get(index + 1) else {
                    return Err("--seed-demo requires a station id".to_string());
                };
                seed_station = Some(value.clone());
                index += 2;
            }
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            other => {
                return Err(format!("unknown argument: {other}"));
            }
        }
    }

    let path_ref = Path::new(&path);
    if let Some(parent) = path_ref.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .map_err(|error| format!("failed to create parent directory: {error}"))?;
    }

    if force && path_ref.exists() {
        std::fs::remove_file(path_ref)
            .map_err(|error| format!("failed to remove existing db file: {error}"))?;
    }

    let mut connection = open_connection(&path).map_err(|error| error.to_string())?;
    run_migrations(&mut connection).map_err(|error| error.to_string())?;
    let version = schema_version(&connection).map_err(|error| error.to_string())?;

    println!("created/updated test db at: {path}");
    println!("schema version: {version}");

    if let Some(station_id) = seed_station {
        upsert_station(&mut connection, &demo_station(&station_id))
            .map_err(|error| error.to_string())?;
        println!("seeded demo station: {station_id} (no heartbeat yet, run heartbeat_probe)");
    }

    Ok(())
}

/// Full-featured variant so every workflow phase can be exercised locally.
fn demo_station(station_id: &str) -> Station {
    Station {
        id: station_id.to_string(),
        status: StationStatus::Available,
        last_heartbeat_at: None,
        capabilities: StationCapabilities {
            rules_gate: true,
            cleanup: true,
            courtesy: true,
            sanitizing: true,
        },
        options: vec![
            ServiceOption {
                option_id: 1,
                name: "Quick rinse".to_string(),
                price_cents: 500,
                duration_seconds: 300,
            },
            ServiceOption {
                option_id: 2,
                name: "Full wash".to_string(),
                price_cents: 1_200,
                duration_seconds: 900,
            },
        ],
    }
}

fn print_help() {
    println!("create_test_db");
    println!();
    println!("Usage:");
    println!("  cargo run --bin create_test_db -- [--path <file>] [--force] [--seed-demo <id>]");
    println!();
    println!("Options:");
    println!("  --path <file>      target sqlite file (default: ./data/petwash_test.db)");
    println!("  --force            delete existing file before creating");
    println!("  --seed-demo <id>   insert a demo station with two wash options");
}
