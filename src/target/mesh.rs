//! Mesh dispatch target.
//!
//! Wraps the local driver and, for tasks whose `requires` labels the local
//! node cannot satisfy, places them on discovered peers: filter by labels,
//! local first, try the next node on failure. Everything except `run_task`
//! delegates to the local driver.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Result, SykliError};
use crate::graph::{Service, Task};
use crate::mesh::placement::{self, Candidate, Strategy};
use crate::mesh::rpc::RpcClient;
use crate::mesh::NodeProfile;

use super::local::LocalTarget;
use super::{NetworkInfo, RunOptions, Target, TaskRun};

/// Local driver plus label-based remote dispatch.
#[derive(Debug)]
pub struct MeshTarget {
    local: LocalTarget,
    local_node: String,
    local_labels: Vec<String>,
    peers: Vec<NodeProfile>,
    cookie: String,
    strategy: Strategy,
}

impl MeshTarget {
    pub fn new(
        workdir: &Path,
        local_node: String,
        local_labels: Vec<String>,
        peers: Vec<NodeProfile>,
        cookie: String,
    ) -> Self {
        Self {
            local: LocalTarget::new(workdir),
            local_node,
            local_labels,
            peers,
            cookie,
            strategy: Strategy::Any,
        }
    }

    fn candidates(&self) -> Vec<Candidate> {
        let mut all = vec![Candidate {
            node: self.local_node.clone(),
            labels: self.local_labels.clone(),
        }];
        for peer in &self.peers {
            if peer.role.accepts_tasks() && peer.name != self.local_node {
                all.push(Candidate {
                    node: peer.name.clone(),
                    labels: peer.capabilities.labels.clone(),
                });
            }
        }
        all
    }

    fn client_for(&self, node: &str) -> Option<RpcClient> {
        let peer = self.peers.iter().find(|p| p.name == node)?;
        Some(RpcClient::new(
            node,
            &format!("{}:{}", peer.host, peer.port),
            &self.cookie,
        ))
    }
}

#[async_trait]
impl Target for MeshTarget {
    async fn setup(&self) -> Result<()> {
        self.local.setup().await
    }

    async fn teardown(&self) -> Result<()> {
        self.local.teardown().await
    }

    async fn resolve_secret(&self, name: &str) -> Result<Option<String>> {
        self.local.resolve_secret(name).await
    }

    async fn start_services(&self, task_name: &str, services: &[Service]) -> Result<NetworkInfo> {
        self.local.start_services(task_name, services).await
    }

    async fn stop_services(&self, network: NetworkInfo) -> Result<()> {
        self.local.stop_services(network).await
    }

    async fn run_task(&self, task: &Task, opts: &RunOptions) -> Result<TaskRun> {
        // Locally satisfiable tasks never leave the machine.
        if task
            .requires
            .iter()
            .all(|label| self.local_labels.contains(label))
        {
            return self.local.run_task(task, opts).await;
        }

        let all = self.candidates();
        let filtered = placement::filter_by_labels(&all, &task.requires);
        let ordered = placement::order(filtered.clone(), &self.local_node, self.strategy);
        debug!(task = %task.name, candidates = ordered.len(), "placing task on the mesh");

        let run_slot: Mutex<Option<TaskRun>> = Mutex::new(None);
        let placed = placement::try_nodes(&ordered, &task.requires, &all, |candidate| {
            let run_slot = &run_slot;
            async move {
                let run = if candidate.node == self.local_node {
                    self.local
                        .run_task(task, opts)
                        .await
                        .map_err(|e| e.to_string())?
                } else {
                    let client = self
                        .client_for(&candidate.node)
                        .ok_or_else(|| format!("no address for node '{}'", candidate.node))?;
                    let outcome = client.run_task(task).await.map_err(|e| e.to_string())?;
                    if outcome.status != crate::exec::TaskStatus::Passed
                        && outcome.status != crate::exec::TaskStatus::Cached
                    {
                        return Err(outcome
                            .error
                            .unwrap_or_else(|| format!("remote status {:?}", outcome.status)));
                    }
                    TaskRun {
                        output: outcome.output,
                        duration_ms: outcome.duration_ms,
                    }
                };
                *run_slot.lock().await = Some(run);
                Ok(())
            }
        })
        .await;

        match placed {
            Ok(node) => {
                info!(task = %task.name, %node, "task placed");
                let run = run_slot.lock().await.take();
                run.ok_or_else(|| SykliError::Internal("placement lost its result".to_string()))
            }
            Err(placement_error) => Err(SykliError::TaskFailed {
                task: task.name.clone(),
                command: task.command.clone(),
                exit_code: 1,
                output: placement_error.to_string(),
                duration_ms: 0,
            }),
        }
    }

    async fn copy_artifact(&self, src: &Path, dest: &Path, workdir: &Path) -> Result<()> {
        self.local.copy_artifact(src, dest, workdir).await
    }

    async fn create_volume(&self, name: &str) -> Result<PathBuf> {
        self.local.create_volume(name).await
    }

    fn artifact_path(&self, task: &Task, output_name: &str, workdir: &Path) -> Option<PathBuf> {
        self.local.artifact_path(task, output_name, workdir)
    }
}
