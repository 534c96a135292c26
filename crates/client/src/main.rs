use clap::{Parser, Subcommand};
use portalloc_client::{ClientError, PortsAllocatorClient};
use portalloc_common::discovery_path;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Discovery file written by the allocator
    #[arg(long, global = true)]
    discovery_file: Option<PathBuf>,

    /// Seconds to wait for the allocator to reply
    #[arg(long, global = true, default_value_t = 30)]
    timeout_secs: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Lease ports
    Ports {
        n: usize,
        /// Lease on behalf of this pid instead of the CLI itself
        #[arg(long)]
        process: Option<u32>,
    },
    /// Mark a lease as connected
    Connected {
        #[arg(long)]
        process: Option<u32>,
    },
    /// Mark a lease as disconnected so its ports can be reclaimed
    Disconnected {
        #[arg(long)]
        process: Option<u32>,
    },
    /// List all active leases
    List,
    /// Run a command with leased ports
    Run {
        /// Number of ports to lease
        n: usize,

        /// Environment variable receiving the comma separated ports
        #[arg(long, default_value = "PORTS")]
        env_name: String,

        /// Command and arguments to execute
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let path = cli.discovery_file.unwrap_or_else(discovery_path);
    let mut client = PortsAllocatorClient::from_discovery_file(&path)?
        .with_reply_timeout(Duration::from_secs(cli.timeout_secs));

    match cli.command {
        Commands::Ports { n, process } => {
            if let Some(pid) = process {
                client = client.with_process_id(pid);
            }
            client.connect().await?;
            match client.get_ports(n).await {
                Ok(ports) => println!("{}", join_ports(&ports)),
                Err(e) => exit_with(e),
            }
        }
        Commands::Connected { process } => {
            if let Some(pid) = process {
                client = client.with_process_id(pid);
            }
            client.connect().await?;
            client.set_connected().await?;
            println!("Process {} connected", client.process_id());
        }
        Commands::Disconnected { process } => {
            if let Some(pid) = process {
                client = client.with_process_id(pid);
            }
            client.connect().await?;
            client.set_disconnected().await?;
            println!("Process {} disconnected", client.process_id());
        }
        Commands::List => {
            client.connect().await?;
            let leases = client.leases().await?;
            println!("Active Leases:");
            for lease in leases {
                println!(
                    "Process: {}, Ports: {}, Status: {}, Since: {}",
                    lease.process,
                    join_ports(&lease.ports),
                    lease.status,
                    lease.requested_at.to_rfc3339()
                );
            }
        }
        Commands::Run { n, env_name, command } => {
            client.connect().await?;
            let ports = match client.get_ports(n).await {
                Ok(ports) => ports,
                Err(e) => exit_with(e),
            };
            let joined = join_ports(&ports);

            let cmd = &command[0];
            let args = &command[1..];
            println!("Running: {} {:?} with {}={}", cmd, args, env_name, joined);

            let child = Command::new(cmd)
                .args(args)
                .env(&env_name, &joined)
                .stdin(Stdio::inherit())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit())
                .spawn();

            let status = match child {
                Ok(mut child) => {
                    if let Err(e) = client.set_connected().await {
                        eprintln!("Failed to report connected status: {}", e);
                    }
                    child.wait().await
                }
                Err(e) => Err(e),
            };

            // Hand the ports back whatever happened to the child
            if let Err(e) = client.set_disconnected().await {
                eprintln!("Failed to release ports {}: {}", joined, e);
            } else {
                println!("Released ports {}", joined);
            }

            match status {
                Ok(s) => {
                    if !s.success() {
                        std::process::exit(s.code().unwrap_or(1));
                    }
                }
                Err(e) => {
                    eprintln!("Failed to run command: {}", e);
                    std::process::exit(1);
                }
            }
        }
    }

    Ok(())
}

fn join_ports(ports: &[u16]) -> String {
    ports
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn exit_with(e: ClientError) -> ! {
    eprintln!("{}", e);
    std::process::exit(match e {
        ClientError::NoPorts => 2,
        _ => 1,
    })
}
