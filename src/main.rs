//! rftp - command-line client
//!
//! Connects, optionally changes into `--cwd`, runs one command and quits.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;

use rftp::cli::{ClientCommand, ClientOpts};
use rftp::logging::init_tracing;
use rftp::progress::BarObserver;
use rftp::Client;

fn main() -> Result<()> {
    let opts = ClientOpts::parse();
    init_tracing(opts.verbose);

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;
    rt.block_on(run(opts))
}

async fn run(opts: ClientOpts) -> Result<()> {
    let mut client = Client::new(opts.client_config()).with_observer(Arc::new(BarObserver::new()));
    client
        .connect()
        .await
        .with_context(|| format!("Failed to connect to {}", opts.server))?;

    if let Some(dir) = &opts.cwd {
        client
            .change_directory(dir)
            .await
            .with_context(|| format!("cd {}", dir))?;
    }

    match &opts.command {
        ClientCommand::Ls => {
            for entry in client.list_files().await.context("ls")? {
                println!("{}", entry);
            }
        }
        ClientCommand::Pwd => println!("{}", client.print_working_directory().await.context("pwd")?),
        ClientCommand::Get { name } => {
            let path = client
                .download_file(name)
                .await
                .with_context(|| format!("get {}", name))?;
            println!("Saved {}", path.display());
        }
        ClientCommand::Put { path, remote_name } => {
            let sent = match remote_name {
                Some(remote) => client.upload_file_as(path, remote).await,
                None => client.upload_file(path).await,
            }
            .with_context(|| format!("put {}", path.display()))?;
            println!("File uploaded successfully ({} bytes)", sent);
        }
        ClientCommand::Mkdir { name } => {
            client
                .create_directory(name)
                .await
                .with_context(|| format!("mkdir {}", name))?;
            println!("Directory created successfully");
        }
        ClientCommand::Rmdir { name } => {
            client
                .remove_directory(name)
                .await
                .with_context(|| format!("rmdir {}", name))?;
            println!("Directory removed successfully");
        }
        ClientCommand::Rm { name } => {
            client
                .delete_file(name)
                .await
                .with_context(|| format!("rm {}", name))?;
            println!("File deleted successfully");
        }
    }

    if client.is_connected() {
        client.quit().await.context("quit")?;
    }
    Ok(())
}
