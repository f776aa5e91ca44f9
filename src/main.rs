use clap::Parser;

#[tokio::main]
async fn main() {
    let cli = hostlink::cli::Cli::parse();
    match hostlink::cli::run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("hostlink: {}", err);
            std::process::exit(1);
        }
    }
}
