use alarm_host::app::{run, HostConfig};

fn main() {
    // stdout carries the call protocol, so logs go to stderr.
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();
    let config = HostConfig::from_env().unwrap_or_default();
    if let Err(err) = run(config) {
        eprintln!("Failed to run alarm host: {err:#}");
    }
}
