fn main() {
    if let Err(err) = petwash_control::app::run_reconcile_job() {
        eprintln!("reconcile job failed: {err}");
        std::process::exit(1);
    }
}
