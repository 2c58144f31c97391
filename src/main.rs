fn main() {
    if let Err(err) = parksense_monitor::app::run() {
        eprintln!("application startup failed: {err}");
        std::process::exit(1);
    }
}
