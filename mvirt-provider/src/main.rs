//! mvirt-provider: apply resource definitions to the mvirt cluster API.
//!
//! Resources are declared in JSON definition files and tracked in a local
//! state file:
//! - `apply` creates new resources and updates changed ones
//! - `read` reports drift between the state file and the cluster
//! - `destroy` deletes a resource and waits until it is gone
//! - `import` adopts an existing object by `<namespace>/<name>`

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mvirt_provider::config::DEFAULT_ENDPOINT;
use mvirt_provider::resource::record_id;
use mvirt_provider::{
    ConfigRecord, LoadBalancerKind, ProviderConfig, ReadOutcome, ResourceData, ResourceKind,
    ResourceState, RestClient, Timeouts, VirtualMachineKind,
};

mod statefile;

use statefile::{load_definitions, ApplyStep, StateFile};

/// mvirt resource provider
#[derive(Parser, Debug)]
#[command(name = "mvirt-provider", version, about)]
struct Args {
    /// Cluster API endpoint
    #[arg(long, env = "MVIRT_ENDPOINT", default_value = DEFAULT_ENDPOINT)]
    endpoint: String,

    /// Timeout per operation in seconds
    #[arg(long, default_value = "120")]
    timeout: u64,

    /// Poll interval in seconds while waiting for deletion
    #[arg(long, default_value = "2")]
    poll_interval: u64,

    /// State file
    #[arg(long, default_value = "mvirt-provider.state.json")]
    state: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create or update the resources in a definition file
    Apply {
        /// JSON file with one definition or a list of definitions
        file: PathBuf,
    },

    /// Compare a managed resource with the cluster
    Read {
        /// Resource address (<type>.<namespace>/<name>)
        address: String,

        /// Adopt the observed state into the state file
        #[arg(long)]
        refresh: bool,
    },

    /// Delete a managed resource
    Destroy {
        /// Resource address (<type>.<namespace>/<name>)
        address: String,
    },

    /// Adopt an existing object into the state file
    Import {
        /// Resource type (mvirt_loadbalancer, mvirt_virtualmachine)
        #[arg(value_name = "TYPE")]
        type_name: String,

        /// Object identifier (<namespace>/<name>)
        id: String,
    },
}

enum Action {
    Apply(ConfigRecord),
    Read { address: String, refresh: bool },
    Destroy { address: String },
    Import { id: String },
}

struct Session {
    config: ProviderConfig,
    client: Arc<RestClient>,
    state: StateFile,
    cancel: watch::Receiver<bool>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mvirt_provider=info,reqwest=warn,hyper=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();

    let config = ProviderConfig {
        endpoint: args.endpoint.clone(),
        timeouts: Timeouts::uniform(Duration::from_secs(args.timeout)),
        poll_interval: Duration::from_secs(args.poll_interval),
    };
    info!("API endpoint: {}", config.endpoint);

    let client = Arc::new(
        config
            .rest_client()
            .with_context(|| format!("Invalid endpoint {}", config.endpoint))?,
    );
    let state = StateFile::load(&args.state).await?;

    // Ctrl-C cancels any wait in progress
    let (cancel_tx, cancel) = watch::channel(false);
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("Received SIGINT, cancelling");
            let _ = cancel_tx.send(true);
        }
    });

    let mut ctx = Session {
        config,
        client,
        state,
        cancel,
    };

    match args.command {
        Command::Apply { file } => {
            for def in load_definitions(&file).await? {
                dispatch(&mut ctx, &def.type_name, Action::Apply(def.config)).await?;
            }
        }
        Command::Read { address, refresh } => {
            let type_name = type_of(&ctx.state, &address)?;
            dispatch(&mut ctx, &type_name, Action::Read { address, refresh }).await?;
        }
        Command::Destroy { address } => {
            let type_name = type_of(&ctx.state, &address)?;
            dispatch(&mut ctx, &type_name, Action::Destroy { address }).await?;
        }
        Command::Import { type_name, id } => {
            dispatch(&mut ctx, &type_name, Action::Import { id }).await?;
        }
    }

    Ok(())
}

fn type_of(state: &StateFile, address: &str) -> Result<String> {
    match state.get(address) {
        Some(entry) => Ok(entry.type_name.clone()),
        None => bail!("{} is not in the state file", address),
    }
}

async fn dispatch(ctx: &mut Session, type_name: &str, action: Action) -> Result<()> {
    if type_name == LoadBalancerKind::TYPE_NAME {
        run::<LoadBalancerKind>(ctx, action).await
    } else if type_name == VirtualMachineKind::TYPE_NAME {
        run::<VirtualMachineKind>(ctx, action).await
    } else {
        bail!("Unknown resource type {}", type_name)
    }
}

async fn run<K: ResourceKind>(ctx: &mut Session, action: Action) -> Result<()> {
    let adapter = ctx.config.adapter::<K, _>(ctx.client.clone());

    match action {
        Action::Apply(record) => {
            let id = record_id::<K>(&record)?;
            let address = StateFile::address(K::TYPE_NAME, &id);

            let data = match ctx.state.apply_step(&address)? {
                ApplyStep::Update(mut data) => {
                    let changes = adapter.update(&mut data, record).await?;
                    if changes.is_empty() {
                        println!("{address}: up to date");
                    } else {
                        let fields: Vec<&str> = changes.iter().map(|c| c.field.as_str()).collect();
                        println!("{address}: updated {}", fields.join(", "));
                    }
                    data
                }
                ApplyStep::Create => {
                    let mut data = ResourceData::new(record);
                    adapter.create(&mut data).await?;
                    println!("{address}: created");
                    data
                }
            };
            ctx.state.insert(address, K::TYPE_NAME, data);
            ctx.state.save().await?;
        }

        Action::Read { address, refresh } => {
            let Some(mut data) = ctx.state.get(&address).map(|e| e.data.clone()) else {
                bail!("{} is not in the state file", address);
            };
            if refresh {
                let drift = adapter.refresh(&mut data).await?;
                for d in &drift {
                    println!("{address}: adopted {} = {}", d.field, d.remote);
                }
                if data.state == ResourceState::Absent {
                    println!("{address}: no longer exists");
                    ctx.state.remove(&address);
                } else {
                    ctx.state.insert(address, K::TYPE_NAME, data);
                }
                ctx.state.save().await?;
            } else {
                match adapter.read(&data).await? {
                    ReadOutcome::NotFound => println!("{address}: not found"),
                    ReadOutcome::Observed { record, drift } => {
                        for d in &drift {
                            println!("{address}: {} {} -> {}", d.field, d.local, d.remote);
                        }
                        println!("{}", serde_json::to_string_pretty(&record)?);
                    }
                }
            }
        }

        Action::Destroy { address } => {
            let Some(mut data) = ctx.state.get(&address).map(|e| e.data.clone()) else {
                bail!("{} is not in the state file", address);
            };
            let result = adapter.delete(&mut data, &mut ctx.cancel).await;
            if data.state == ResourceState::Absent {
                ctx.state.remove(&address);
            } else {
                ctx.state.insert(address.clone(), K::TYPE_NAME, data);
            }
            ctx.state.save().await?;
            result?;
            println!("{address}: destroyed");
        }

        Action::Import { id } => {
            let address = StateFile::address(K::TYPE_NAME, &id);
            if ctx.state.get(&address).is_some() {
                bail!("{} is already managed", address);
            }
            let data = adapter.import(&id).await?;
            ctx.state.insert(address.clone(), K::TYPE_NAME, data);
            ctx.state.save().await?;
            println!("{address}: imported");
        }
    }

    Ok(())
}
