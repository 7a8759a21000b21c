//! Gigarecon client side executable: one-shot name-service and application
//! requests against a running cluster.

use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use tokio::runtime::Builder;
use tokio::time::Duration;

use gigarecon::{
    logger_init, pf_error, pf_info, AppReply, ClientId, ClusterConfig,
    NodeConfigChange, NodeDirectory, NodeId, Pool, ReconClient, ReconError,
    ReconMsg, ME,
};

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Path to the cluster TOML file.
    #[arg(short, long)]
    cluster: PathBuf,

    /// ID of the node to send the request to.
    #[arg(short, long)]
    via: String,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 2)]
    threads: usize,

    /// Reply timeout duration in millisecs.
    #[arg(long, default_value_t = 5000)]
    timeout_ms: u64,

    #[command(subcommand)]
    command: Command,
}

/// Client request to issue.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
enum Command {
    /// Create a name with an initial state.
    Create {
        name: String,
        #[arg(default_value_t = String::from(""))]
        initial_state: String,
    },

    /// Delete a name.
    Delete { name: String },

    /// Look up the current active replicas of a name.
    Lookup { name: String },

    /// Read a key of a name's state.
    Get { name: String, key: String },

    /// Write a key of a name's state.
    Put {
        name: String,
        key: String,
        value: String,
    },

    /// Add a node to a pool of the running cluster.
    AddNode {
        /// "active" or "reconfigurator".
        pool: String,
        id: String,
        addr: SocketAddr,
    },

    /// Remove a node from its pool of the running cluster.
    RemoveNode { id: String },
}

impl Command {
    /// True for application requests, which must reach an active replica.
    fn is_app_request(&self) -> bool {
        matches!(self, Command::Get { .. } | Command::Put { .. })
    }
}

/// Node-config change a node command asks for, given the cluster file's
/// view of the pools.
fn node_change(
    command: &Command,
    directory: &NodeDirectory,
) -> Result<Option<NodeConfigChange>, ReconError> {
    let mut change = NodeConfigChange::default();
    match command {
        Command::AddNode { pool, id, addr } => match pool.as_str() {
            "active" => {
                change.add_actives.insert(id.parse()?, *addr);
            }
            "reconfigurator" => {
                change.add_reconfigurators.insert(id.parse()?, *addr);
            }
            _ => {
                return Err(ReconError::msg(format!("invalid pool '{}'", pool)));
            }
        },
        Command::RemoveNode { id } => {
            let id: NodeId = id.parse()?;
            match directory.pool_of(&id) {
                Some(Pool::Active) => {
                    change.remove_actives.insert(id);
                }
                Some(Pool::Reconfigurator) => {
                    change.remove_reconfigurators.insert(id);
                }
                None => {
                    return Err(ReconError::msg(format!(
                        "node {} not in cluster file",
                        id
                    )));
                }
            }
        }
        _ => return Ok(None),
    }
    Ok(Some(change))
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(via)` on success or
    /// `Err(ReconError)` on any error.
    fn sanitize(&self) -> Result<NodeId, ReconError> {
        if self.threads < 1 {
            Err(ReconError::msg(format!(
                "invalid number of threads {}",
                self.threads
            )))
        } else if self.timeout_ms == 0 {
            Err(ReconError::msg(format!(
                "invalid timeout duration {} ms",
                self.timeout_ms
            )))
        } else {
            self.via.parse()
        }
    }
}

/// Looks up `name` through the reconfigurator `client` is connected to and
/// connects to the first reachable active replica of the reply.
async fn resolve_active(
    client: &mut ReconClient,
    directory: &NodeDirectory,
    name: &str,
    timeout: Duration,
) -> Result<ReconClient, ReconError> {
    let reply = client.lookup(name).await?;
    let ReconMsg::ActiveReplicas { actives, epoch, .. } = reply else {
        return Err(ReconError::msg(format!(
            "lookup of '{}' failed: {:?}",
            name, reply
        )));
    };
    pf_info!("'{}' at epoch {} served by {:?}", name, epoch, actives);
    let Some(addr) = actives.iter().find_map(|id| directory.addr_of(id)) else {
        return Err(ReconError::msg(format!(
            "no reachable active replica for '{}'",
            name
        )));
    };
    ReconClient::connect(client.id(), addr, timeout).await
}

fn print_app_reply(reply: &AppReply) {
    if !reply.success {
        println!("FAILED {}", reply.name);
    } else if let Some(value) = &reply.value {
        println!("{}", value);
    } else {
        println!("OK");
    }
}

/// Actual main function of gigarecon client.
fn client_main() -> Result<(), ReconError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    let via = args.sanitize()?;

    let id: ClientId = rand::random();
    let _ = ME.set(format!("c{}", id));

    let cluster = ClusterConfig::parse(&fs::read_to_string(&args.cluster)?)?;
    let directory = NodeDirectory::from_cluster(&cluster)?;
    let (Some(pool), Some(addr)) =
        (directory.pool_of(&via), directory.addr_of(&via))
    else {
        return Err(ReconError::msg(format!(
            "node {} not in cluster file {}",
            via,
            args.cluster.display()
        )));
    };
    if pool == Pool::Active && !args.command.is_app_request() {
        return Err(ReconError::msg(format!(
            "{} is an active replica; name requests go to reconfigurators",
            via
        )));
    }
    let timeout = Duration::from_millis(args.timeout_ms);
    let change = node_change(&args.command, &directory)?;

    // create tokio multi-threaded runtime
    let runtime = Builder::new_multi_thread()
        .enable_all()
        .worker_threads(args.threads)
        .thread_name("tokio-worker-client")
        .build()?;

    runtime.block_on(async move {
        let mut client = ReconClient::connect(id, addr, timeout).await?;
        match args.command {
            Command::Create {
                name,
                initial_state,
            } => {
                println!("{:?}", client.create(&name, &initial_state).await?);
            }
            Command::Delete { name } => {
                println!("{:?}", client.delete(&name).await?);
            }
            Command::Lookup { name } => {
                println!("{:?}", client.lookup(&name).await?);
            }
            Command::Get { name, key } => {
                let mut target = match pool {
                    Pool::Active => client,
                    Pool::Reconfigurator => resolve_active(
                        &mut client,
                        &directory,
                        &name,
                        timeout,
                    )
                    .await?,
                };
                print_app_reply(&target.get(&name, &key).await?);
            }
            Command::Put { name, key, value } => {
                let mut target = match pool {
                    Pool::Active => client,
                    Pool::Reconfigurator => resolve_active(
                        &mut client,
                        &directory,
                        &name,
                        timeout,
                    )
                    .await?,
                };
                print_app_reply(&target.put(&name, &key, &value).await?);
            }
            Command::AddNode { .. } | Command::RemoveNode { .. } => {
                let Some(change) = change else {
                    return Err(ReconError::msg("no node change to send"));
                };
                println!("{:?}", client.reconfigure_nodes(change).await?);
            }
        }
        Ok::<(), ReconError>(()) // give type hint for this async closure
    })
}

/// Main function of gigarecon client.
fn main() -> ExitCode {
    logger_init();

    if let Err(ref e) = client_main() {
        pf_error!("client_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
