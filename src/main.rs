fn main() {
    if let Err(err) = petwash_control::app::run() {
        eprintln!("application startup failed: {err}");
        std::process::exit(1);
    }
}
