fn main() {
    if let Err(err) = petwash_control::app::run_heartbeat_probe_job() {
        eprintln!("heartbeat probe failed: {err}");
        std::process::exit(1);
    }
}
