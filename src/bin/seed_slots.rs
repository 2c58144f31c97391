use std::path::Path;

use chrono::{SecondsFormat, Utc};
use parksense_monitor::adapters::db::{
    get_slot_by_name, insert_slot, open_connection, run_migrations,
};
use parksense_monitor::domain::models::NewSlotRecord;

fn main() {
    if let Err(error) = run() {
        eprintln!("failed to seed slots: {error}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let mut path = "./data/parksense.db".to_string();
    let mut count: u32 = 5;
    let mut allowed_minutes: i64 = 60;

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
            "--count" => {
                let Some(value) = args.get(index + 1) else {
                    return Err("--count requires a value".to_string());
                };
                count = value
                    .parse()
                    .map_err(|_| "--count must be a number".to_string())?;
                index += 2;
            }
            "--allowed-minutes" => {
                let Some(value) = args.get(index + 1) else {
                    return Err("--allowed-minutes requires a value".to_string());
                };
                allowed_minutes = value
                    .parse()
                    .map_err(|_| "--allowed-minutes must be a number".to_string())?;
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

    if let Some(parent) = Path::new(&path).parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .map_err(|error| format!("failed to create parent directory: {error}"))?;
    }

    let mut connection = open_connection(&path).map_err(|error| error.to_string())?;
    run_migrations(&mut connection).map_err(|error| error.to_string())?;

    let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
    let mut created = 0;
    for number in 1..=count {
        let name = format!("P{number}");
        let exists = get_slot_by_name(&connection, &name)
            .map_err(|error| error.to_string())?
            .is_some();
        if exists {
            println!("slot {name} already exists, skipping");
            continue;
        }
        insert_slot(
            &connection,
            &NewSlotRecord {
                name: name.clone(),
                allowed_minutes,
            },
            &now,
        )
        .map_err(|error| error.to_string())?;
        println!("created slot {name}");
        created += 1;
    }

    println!("done: {created} new slots in {path}");
    Ok(())
}

fn print_help() {
    println!("seed_slots");
    println!();
    println!("Usage:");
    println!("  cargo run --bin seed_slots -- [--path <file>] [--count <n>] [--allowed-minutes <m>]");
    println!();
    println!("Options:");
    println!("  --path <file>          target sqlite file (default: ./data/parksense.db)");
    println!("  --count <n>            number of slots P1..Pn to create (default: 5)");
    println!("  --allowed-minutes <m>  allowed minutes per slot (default: 60)");
}
