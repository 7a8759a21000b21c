//! Gigarecon node executable. Runs either an active replica or a
//! reconfigurator, depending on which pool of the cluster file the given
//! node ID belongs to.

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::{self, LevelFilter};
use tokio::runtime::Builder;
use tokio::sync::watch;

use gigarecon::app::KvApplication;
use gigarecon::{
    logger_init, pf_error, pf_info, ActiveReplicaNode, ClusterConfig,
    GenericNode, NodeDirectory, NodeId, Pool, ReconError, ReconfiguratorNode,
    ME,
};

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// ID of this node, as listed in the cluster file.
    #[arg(short, long)]
    id: String,

    /// Path to the cluster TOML file.
    #[arg(short, long)]
    cluster: PathBuf,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 8)]
    threads: usize,
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(id)` on success or
    /// `Err(ReconError)` on any error.
    fn sanitize(&self) -> Result<NodeId, ReconError> {
        if self.threads < 2 {
            Err(ReconError::msg(format!(
                "invalid number of threads {}",
                self.threads
            )))
        } else {
            self.id.parse()
        }
    }
}

/// Actual main function of a gigarecon node.
fn server_main() -> Result<(), ReconError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    let me = args.sanitize()?;
    let _ = ME.set(me.to_string());

    let cluster = ClusterConfig::parse(&fs::read_to_string(&args.cluster)?)?;
    let Some(pool) = NodeDirectory::from_cluster(&cluster)?.pool_of(&me) else {
        return Err(ReconError::msg(format!(
            "node {} not in cluster file {}",
            me,
            args.cluster.display()
        )));
    };

    // set up termination signals handler
    let (tx_term, rx_term) = watch::channel(false);
    ctrlc::set_handler(move || {
        if let Err(e) = tx_term.send(true) {
            pf_error!("error sending to term channel: {}", e);
        }
    })?;

    let log_level = log::max_level();
    {
        // create tokio multi-threaded runtime
        let runtime = Builder::new_multi_thread()
            .enable_all()
            .worker_threads(args.threads)
            .thread_name("tokio-worker-node")
            .build()?;

        // enter tokio runtime, set up the node, and start the main event
        // loop logic
        runtime.block_on(async move {
            match pool {
                Pool::Active => {
                    let mut node = ActiveReplicaNode::new_and_setup(
                        me,
                        &cluster,
                        Box::new(KvApplication::new()),
                    )
                    .await?;
                    pf_info!("running as active replica");
                    node.run(rx_term).await?;
                }
                Pool::Reconfigurator => {
                    let mut node =
                        ReconfiguratorNode::new_and_setup(me, &cluster).await?;
                    pf_info!("running as reconfigurator");
                    node.run(rx_term).await?;
                }
            }

            // suppress logging before dropping the runtime to avoid spurious
            // error messages
            log::set_max_level(LevelFilter::Off);

            Ok::<(), ReconError>(()) // give type hint for this async closure
        })?;
    } // drop the runtime here

    log::set_max_level(log_level);
    Ok(())
}

/// Main function of a gigarecon node.
fn main() -> ExitCode {
    logger_init();

    if let Err(ref e) = server_main() {
        pf_error!("server_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
