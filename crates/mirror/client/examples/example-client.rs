use std::net::SocketAddr;

use clap::Parser;
use color_eyre::{eyre::WrapErr, Result};
use mirror_client::Session;
use tracing::info;
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

/// Connects to a `mirror-server` binary and pokes at its root object.
#[derive(Parser, Debug, Clone)]
#[clap(author, version, about)]
pub struct Args {
	#[clap(long, default_value = "127.0.0.1:9411")]
	addr: SocketAddr,
	/// Text to bounce off the root's `Echo` method.
	#[clap(long, default_value = "hello fabric")]
	message: String,
}

#[tokio::main]
async fn main() -> Result<()> {
	color_eyre::install()?;

	let env_filter = EnvFilter::builder()
		.with_default_directive(LevelFilter::INFO.into())
		.from_env_lossy();

	tracing_subscriber::fmt()
		.with_target(true)
		.with_level(true)
		.with_env_filter(env_filter)
		.init();

	let args = Args::parse();

	let session = Session::connect(args.addr)
		.await
		.wrap_err("failed to connect")?;
	let root = session.root().await.wrap_err("root query failed")?;
	info!("connected, root is a {} ({})", root.type_name(), root.id());

	let reply = root
		.invoke("Echo", vec![args.message.clone().into()])
		.await
		.wrap_err("echo failed")?;
	info!("echoed back: {:?}", reply.as_str());

	if let Some(greeting) = root.cached("Greeting") {
		info!("populated greeting: {:?}", greeting.as_str());
	}

	session.close();
	Ok(())
}
