use clap::Parser;
use mirror_server::Args;

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
	let args = Args::parse();
	mirror_server::main(args).await
}
