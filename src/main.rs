use clap::Parser;
use netconpaas::{client::ConpaasClient, config::ClientConfigCli};

/// Manage services on a ConPaaS deployment.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Arguments {
    #[command(flatten)]
    client: ClientConfigCli,
}

fn main() {
    let args = Arguments::parse();
    match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime.block_on(async {
            ConpaasClient::main(args.client).await;
        }),
        Err(e) => eprintln!("failed to start runtime: {e}"),
    }
}
