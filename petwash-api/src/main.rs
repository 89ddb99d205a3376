fn main() {
    if let Err(err) = petwash_control::app::run_api() {
        eprintln!("api startup failed: {err}");
        std::process::exit(1);
    }
}
