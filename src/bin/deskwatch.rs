use clap::Parser;
use deskwatch::dw::{build_info, cli};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = cli::Args::parse();
    println!("{}", build_info::banner());
    cli::run(args).await
}
