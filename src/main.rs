use std::env;

use clap::Parser;
use fire_policy::api::{Cli, init_logging, run_cli, run_http_server};

#[tokio::main]
async fn main() {
    let raw_args: Vec<String> = env::args().collect();
    if raw_args.get(1).map(|s| s.as_str()) == Some("serve") {
        let port = raw_args
            .get(2)
            .and_then(|s| s.parse::<u16>().ok())
            .unwrap_or(8080);
        if let Err(e) = init_logging(None) {
            eprintln!("Logger error: {e}");
        }
        if let Err(e) = run_http_server(port).await {
            eprintln!("Server error: {e}");
            std::process::exit(1);
        }
        return;
    }

    let cli = Cli::parse();
    let result = tokio::task::spawn_blocking(move || run_cli(cli))
        .await
        .map_err(|e| e.to_string())
        .and_then(|r| r);
    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
