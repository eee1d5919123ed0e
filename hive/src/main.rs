use clap::Parser;

mod cli;

#[tokio::main]
async fn main() {
    let cli = cli::Cli::parse();
    let name = cli.command.name();
    if let Err(err) = cli::run(cli).await {
        eprintln!("{name} error: {err:#}");
        std::process::exit(1);
    }
}
