//! Machine Commands

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use metal_common::{ResourceSnapshot, ResourceSpec, WaitSpec};
use metal_provider::{ApplyAction, LifecycleReconciler, MetalClient, PriorState, ProviderConfig};

use crate::output::{print_drift, print_item, print_success, OutputFormat, TableDisplay};

#[derive(Subcommand)]
pub enum MachineCommands {
    /// Create a machine and wait until it is ready
    Create {
        #[command(flatten)]
        spec: SpecArgs,

        /// Override the readiness timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Record the created machine in this state file
        #[arg(long)]
        state: Option<PathBuf>,
    },

    /// Get machine details
    Get {
        /// Machine ID
        id: String,

        /// Declared spec file to report drift against
        #[arg(long)]
        spec: Option<PathBuf>,
    },

    /// Delete a machine
    Delete {
        /// Machine ID
        id: String,
    },

    /// Wait until a machine attribute reaches a value
    Wait {
        /// Machine ID
        id: String,

        /// Attribute to watch
        #[arg(long, default_value = "state")]
        attribute: String,

        /// Value to wait for
        #[arg(long, default_value = "Active")]
        target: String,

        /// Timeout in seconds
        #[arg(long, default_value = "3600")]
        timeout: u64,
    },

    /// Reconcile a spec file against the machine recorded in a state file
    Apply {
        /// Desired spec (TOML, or JSON with a .json extension)
        spec: PathBuf,

        /// State file holding the previously applied machine
        #[arg(long)]
        state: PathBuf,
    },
}

/// Machine spec given on the command line
#[derive(Args)]
pub struct SpecArgs {
    /// Hostname
    #[arg(long)]
    hostname: String,

    /// Display name (defaults to hostname)
    #[arg(short, long)]
    name: Option<String>,

    /// Description
    #[arg(long)]
    description: Option<String>,

    /// Image ID
    #[arg(long)]
    image: String,

    /// Partition ID
    #[arg(long)]
    partition: String,

    /// Size ID
    #[arg(long)]
    size: String,

    /// Project ID
    #[arg(long)]
    project: Option<String>,

    /// Tags to attach
    #[arg(long = "tag")]
    tags: Vec<String>,

    /// File with the bootstrap payload
    #[arg(long)]
    user_data: Option<PathBuf>,

    /// SSH public key references
    #[arg(long = "ssh-key")]
    ssh_keys: Vec<String>,
}

impl SpecArgs {
    fn into_spec(self) -> Result<ResourceSpec> {
        let user_data = self
            .user_data
            .map(|path| {
                std::fs::read_to_string(&path)
                    .with_context(|| format!("cannot read user data from {}", path.display()))
            })
            .transpose()?;

        Ok(ResourceSpec {
            hostname: self.hostname,
            name: self.name,
            description: self.description,
            image: self.image,
            partition: self.partition,
            size: self.size,
            project: self.project,
            tags: self.tags,
            user_data,
            ssh_public_keys: self.ssh_keys,
        })
    }
}

/// Machine display wrapper for serialization
#[derive(Serialize)]
pub struct MachineDisplay {
    pub id: String,
    pub hostname: String,
    pub name: String,
    pub state: String,
    pub partition: String,
    pub size: String,
    pub image: String,
    pub public_ipv4: Option<String>,
    pub private_ipv4: Option<String>,
    pub created: String,
}

impl From<&ResourceSnapshot> for MachineDisplay {
    fn from(snapshot: &ResourceSnapshot) -> Self {
        let alloc = &snapshot.allocation;
        Self {
            id: snapshot.id.clone(),
            hostname: alloc.hostname.clone(),
            name: alloc.name.clone(),
            state: snapshot.state.to_string(),
            partition: alloc.partition.clone(),
            size: alloc.size.clone(),
            image: alloc.image.clone(),
            public_ipv4: snapshot.access_public_ipv4().map(str::to_string),
            private_ipv4: snapshot.access_private_ipv4().map(str::to_string),
            created: snapshot.created.to_rfc3339(),
        }
    }
}

impl TableDisplay for MachineDisplay {
    fn headers() -> Vec<&'static str> {
        vec![
            "ID", "Hostname", "Name", "State", "Partition", "Size", "Image", "Public IPv4",
            "Private IPv4", "Created",
        ]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.id.clone(),
            self.hostname.clone(),
            self.name.clone(),
            self.state.clone(),
            self.partition.clone(),
            self.size.clone(),
            self.image.clone(),
            self.public_ipv4.clone().unwrap_or_else(|| "-".to_string()),
            self.private_ipv4.clone().unwrap_or_else(|| "-".to_string()),
            self.created.clone(),
        ]
    }
}

/// Load a spec from TOML, or JSON when the file ends in `.json`
pub fn load_spec(path: &Path) -> Result<ResourceSpec> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read spec {}", path.display()))?;

    let spec = if path.extension().is_some_and(|ext| ext == "json") {
        serde_json::from_str(&content)?
    } else {
        toml::from_str(&content)?
    };
    Ok(spec)
}

/// Load the previously applied machine, `None` if nothing was applied yet
pub fn load_state(path: &Path) -> Result<Option<PriorState>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)?;
    let state = serde_json::from_str(&content)
        .with_context(|| format!("corrupt state file {}", path.display()))?;
    Ok(Some(state))
}

pub fn save_state(path: &Path, state: &PriorState) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(state)?)?;
    Ok(())
}

pub async fn execute(cmd: MachineCommands, config: &ProviderConfig, format: OutputFormat) -> Result<()> {
    let client = Arc::new(MetalClient::new(config)?);
    let ready = config.ready_wait();

    match cmd {
        MachineCommands::Create { spec, timeout, state } => {
            let spec = spec.into_spec()?;
            let ready = match timeout {
                Some(secs) => WaitSpec {
                    timeout: Duration::from_secs(secs),
                    ..ready
                },
                None => ready,
            };
            let reconciler = LifecycleReconciler::new(client, ready);

            let snapshot = reconciler.create(&spec).await?;
            if let Some(path) = state {
                save_state(&path, &PriorState { id: snapshot.id.clone(), spec })?;
            }

            print_success(&format!("Machine '{}' created", snapshot.id));
            print_item(&MachineDisplay::from(&snapshot), format)?;
        }

        MachineCommands::Get { id, spec } => {
            let reconciler = LifecycleReconciler::new(client, ready);
            let snapshot = match spec {
                Some(path) => {
                    let declared = load_spec(&path)?;
                    let (snapshot, drift) = reconciler.read_with_drift(&id, &declared).await?;
                    print_drift(&drift);
                    snapshot
                }
                None => reconciler.read(&id).await?,
            };
            print_item(&MachineDisplay::from(&snapshot), format)?;
        }

        MachineCommands::Delete { id } => {
            let reconciler = LifecycleReconciler::new(client, ready);
            reconciler.delete(&id).await?;
            print_success(&format!("Machine '{}' deleted", id));
        }

        MachineCommands::Wait { id, attribute, target, timeout } => {
            let reconciler = LifecycleReconciler::new(client, ready);
            let wait = WaitSpec::new(attribute, target, Duration::from_secs(timeout))
                .with_min_timeout(reconciler.ready_condition().min_timeout);

            let snapshot = reconciler.wait_for(&id, &wait).await?;
            print_success(&format!("Machine '{}' reached {} = {}", id, wait.attribute, wait.target));
            print_item(&MachineDisplay::from(&snapshot), format)?;
        }

        MachineCommands::Apply { spec, state } => {
            let desired = load_spec(&spec)?;
            let prior = load_state(&state)?;
            let reconciler = LifecycleReconciler::new(client, ready);

            let outcome = reconciler.apply(&desired, prior.as_ref()).await?;
            save_state(
                &state,
                &PriorState {
                    id: outcome.snapshot.id.clone(),
                    spec: desired,
                },
            )?;

            match &outcome.action {
                ApplyAction::Created => print_success(&format!("Machine '{}' created", outcome.snapshot.id)),
                ApplyAction::Replaced { previous_id, fields } => print_success(&format!(
                    "Machine '{}' replaced by '{}' ({} changed)",
                    previous_id,
                    outcome.snapshot.id,
                    fields.join(", ")
                )),
                ApplyAction::Refreshed => print_success(&format!("Machine '{}' up to date", outcome.snapshot.id)),
            }
            print_drift(&outcome.drift);
            print_item(&MachineDisplay::from(&outcome.snapshot), format)?;
        }
    }

    Ok(())
}
