fn main() {
    if let Err(err) = petwash_control::app::run_service() {
        eprintln!("service startup failed: {err}");
        std::process::exit(1);
    }
}
