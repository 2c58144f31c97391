use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};

const SLOT_NAMES: &[&str] = &["P1", "P2", "P3"];

fn main() {
    if let Err(error) = run() {
        eprintln!("simulator failed: {error}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let mut bind = "127.0.0.1:3333".to_string();
    let mut step_ms: u64 = 2000;

    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut index = 0;
    while index < args.len() {
        match args[index].as_str() {
            "--bind" => {
                let Some(value) = args.get(index + 1) else {
                    return Err("--bind requires a value".to_string());
                };
                bind = value.clone();
                index += 2;
            }
            "--step-ms" => {
                let Some(value) = args.get(index + 1) else {
                    return Err("--step-ms requires a value".to_string());
                };
                step_ms = value
                    .parse()
                    .map_err(|_| "--step-ms must be a number".to_string())?;
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

    let listener = TcpListener::bind(&bind).map_err(|error| error.to_string())?;
    println!("[{}] simulated device listening on {bind}", now_iso());

    // One monitor at a time, like a real SPP device.
    for stream in listener.incoming() {
        let stream = match stream {
            Ok(stream) => stream,
            Err(error) => {
                println!("[{}] accept failed: {error}", now_iso());
                continue;
            }
        };
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        println!("[{}] monitor connected from {peer}", now_iso());

        if let Err(error) = serve_connection(stream, step_ms) {
            println!("[{}] connection ended: {error}", now_iso());
        } else {
            println!("[{}] monitor disconnected", now_iso());
        }
    }

    Ok(())
}

/// Streams a scripted occupancy cycle per slot while a responder thread
/// answers inbound commands on the same socket.
fn serve_connection(stream: TcpStream, step_ms: u64) -> Result<(), String> {
    let reader_stream = stream
        .try_clone()
        .map_err(|error| format!("failed to clone stream: {error}"))?;
    let responder = thread::spawn(move || respond_to_commands(reader_stream));

    let mut writer = stream;
    let step = Duration::from_millis(step_ms);
    let script: &[(&str, &str)] = &[
        ("P1", "occupied"),
        ("P2", "occupied"),
        ("P1", "occupied"), // redundant repeat, the monitor must dedupe
        ("P2", "vacant"),
        ("P1", "overtime"),
        ("P3", "occupied"),
        ("P1", "vacant"),
        ("P3", "vacant"),
    ];

    let mut rssi = -55_i64;
    loop {
        for (slot, status) in script {
            let line = format!("SLOT:{slot}:{status}\n");
            writer
                .write_all(line.as_bytes())
                .map_err(|error| error.to_string())?;
            print!("[{}] >> {line}", now_iso());

            rssi = if rssi <= -75 { -55 } else { rssi - 2 };
            writer
                .write_all(format!("RSSI:{rssi}\n").as_bytes())
                .map_err(|error| error.to_string())?;

            thread::sleep(step);
        }

        if responder.is_finished() {
            return Err("peer closed the read side".to_string());
        }
    }
}

fn respond_to_commands(stream: TcpStream) {
    let mut writer = match stream.try_clone() {
        Ok(writer) => writer,
        Err(_) => return,
    };
    let reader = BufReader::new(stream);

    for line in reader.lines() {
        let Ok(line) = line else {
            return;
        };
        let command = line.trim();
        if command.is_empty() {
            continue;
        }
        println!("[{}] << {command}", now_iso());

        let reply = match command.split(':').collect::<Vec<_>>().as_slice() {
            ["PING", slot] => Some(format!("PONG:{slot}\n")),
            ["READ", slot] => Some(format!("SENSOR:{slot}:{}\n", 400 + slot.len() * 17)),
            ["READ_DIST"] => Some("SENSOR:DIST:123\n".to_string()),
            ["ENABLE", slot] => Some(format!("SLOT:{slot}:vacant\n")),
            _ => None, // DISABLE, SERVO and LCD are fire-and-forget
        };

        if let Some(reply) = reply
            && writer.write_all(reply.as_bytes()).is_err()
        {
            return;
        }
    }
}

fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn print_help() {
    println!("simulate_device");
    println!();
    println!("Usage:");
    println!("  cargo run --bin simulate_device -- [--bind <addr>] [--step-ms <ms>]");
    println!();
    println!("Options:");
    println!("  --bind <addr>    listen address (default: 127.0.0.1:3333)");
    println!("  --step-ms <ms>   delay between scripted reports (default: 2000)");
    println!();
    println!("Slots in the script: {}", SLOT_NAMES.join(", "));
}
