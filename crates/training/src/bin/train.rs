use std::io::Write;

use clap::Parser;
use training::{run, Args};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            writeln!(
                buf,
                "{} {:<5} {}",
                buf.timestamp_millis(),
                record.level(),
                record.args()
            )
        })
        .init();

    let args = Args::parse();
    if let Err(err) = run(&args) {
        log::error!("{} failed: {}", args.exp, err);
        std::process::exit(1);
    }
}
