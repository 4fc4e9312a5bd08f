//! Multi-process launcher.
//!
//! On each machine the launcher process spawns one worker per GPU, each a
//! copy of the current executable with its rank in the environment. A world
//! of one runs the worker in-process instead.

use super::{Comm, TcpGroup, World};
use crate::error::{Result, SegTrainError};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub const ENV_LOCAL_RANK: &str = "SEGTRAIN_LOCAL_RANK";
pub const ENV_RANK: &str = "SEGTRAIN_RANK";
pub const ENV_WORLD_SIZE: &str = "SEGTRAIN_WORLD_SIZE";
pub const ENV_MACHINE_RANK: &str = "SEGTRAIN_MACHINE_RANK";
pub const ENV_NUM_GPUS: &str = "SEGTRAIN_NUM_GPUS";
pub const ENV_DIST_URL: &str = "SEGTRAIN_DIST_URL";

#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub num_gpus: usize,
    pub num_machines: usize,
    pub machine_rank: usize,
    /// `tcp://host:port`, or `auto` for a free local port (single machine only).
    pub dist_url: String,
    pub timeout: Duration,
    /// Extra environment passed to spawned workers.
    pub worker_env: Vec<(String, String)>,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            num_gpus: 1,
            num_machines: 1,
            machine_rank: 0,
            dist_url: "auto".to_string(),
            timeout: Duration::from_secs(30 * 60),
            worker_env: Vec::new(),
        }
    }
}

impl LaunchOptions {
    pub fn world_size(&self) -> usize {
        self.num_gpus.max(1) * self.num_machines.max(1)
    }

    fn validate(&self) -> Result<()> {
        if self.num_gpus == 0 || self.num_machines == 0 {
            return Err(SegTrainError::distributed(
                "num_gpus and num_machines must be at least 1",
            ));
        }
        if self.machine_rank >= self.num_machines {
            return Err(SegTrainError::distributed(format!(
                "machine_rank {} must be below num_machines {}",
                self.machine_rank, self.num_machines
            )));
        }
        if self.dist_url == "auto" && self.num_machines > 1 {
            return Err(SegTrainError::distributed(
                "dist_url=auto is not supported for multi-machine jobs",
            ));
        }
        Ok(())
    }
}

/// Rank assignment a spawned worker reads from its environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerEnv {
    pub world: World,
    pub dist_url: String,
}

impl WorkerEnv {
    /// `None` when this process was not spawned by the launcher.
    pub fn from_env() -> Result<Option<Self>> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Option<Self>> {
        let Some(rank) = lookup(ENV_RANK) else {
            return Ok(None);
        };
        let number = |key: &str, raw: Option<String>| -> Result<usize> {
            raw.ok_or_else(|| SegTrainError::distributed(format!("{key} is not set")))?
                .parse()
                .map_err(|e| SegTrainError::distributed(format!("{key} is not a number: {e}")))
        };
        let world = World {
            rank: number(ENV_RANK, Some(rank))?,
            local_rank: number(ENV_LOCAL_RANK, lookup(ENV_LOCAL_RANK))?,
            world_size: number(ENV_WORLD_SIZE, lookup(ENV_WORLD_SIZE))?,
            machine_rank: number(ENV_MACHINE_RANK, lookup(ENV_MACHINE_RANK))?,
            num_workers_per_machine: number(ENV_NUM_GPUS, lookup(ENV_NUM_GPUS))?,
        };
        let dist_url = lookup(ENV_DIST_URL)
            .ok_or_else(|| SegTrainError::distributed(format!("{ENV_DIST_URL} is not set")))?;
        Ok(Some(Self { world, dist_url }))
    }

    fn to_vars(&self) -> Vec<(&'static str, String)> {
        vec![
            (ENV_LOCAL_RANK, self.world.local_rank.to_string()),
            (ENV_RANK, self.world.rank.to_string()),
            (ENV_WORLD_SIZE, self.world.world_size.to_string()),
            (ENV_MACHINE_RANK, self.world.machine_rank.to_string()),
            (ENV_NUM_GPUS, self.world.num_workers_per_machine.to_string()),
            (ENV_DIST_URL, self.dist_url.clone()),
        ]
    }
}

/// Bind an ephemeral local port and release it.
pub fn free_local_port() -> Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

/// Run `worker` once per process of the job.
///
/// Called from a spawned worker, this joins the process group and runs the
/// worker. Called from a launcher, it either runs the worker in-process
/// (world of one) or spawns one child per GPU and waits for all of them.
pub async fn launch<F, Fut>(options: &LaunchOptions, worker: F) -> Result<()>
where
    F: FnOnce(World, Comm) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    if let Some(env) = WorkerEnv::from_env()? {
        let group = TcpGroup::connect(
            &env.dist_url,
            env.world.rank,
            env.world.world_size,
            options.timeout,
        )
        .await?;
        tracing::info!(rank = env.world.rank, world_size = env.world.world_size, "worker started");
        return worker(env.world, Comm::Tcp(Arc::new(group))).await;
    }

    options.validate()?;
    let world_size = options.world_size();
    if world_size == 1 {
        return worker(World::single(), Comm::Local).await;
    }
    spawn_workers(options).await
}

async fn spawn_workers(options: &LaunchOptions) -> Result<()> {
    let dist_url = if options.dist_url == "auto" {
        format!("tcp://127.0.0.1:{}", free_local_port()?)
    } else {
        options.dist_url.clone()
    };
    let exe = std::env::current_exe()?;
    let args: Vec<_> = std::env::args_os().skip(1).collect();
    let world_size = options.world_size();

    let mut children = Vec::with_capacity(options.num_gpus);
    for local_rank in 0..options.num_gpus {
        let env = WorkerEnv {
            world: World {
                world_size,
                rank: options.machine_rank * options.num_gpus + local_rank,
                local_rank,
                machine_rank: options.machine_rank,
                num_workers_per_machine: options.num_gpus,
            },
            dist_url: dist_url.clone(),
        };
        let mut cmd = tokio::process::Command::new(&exe);
        cmd.args(&args).kill_on_drop(true);
        for (key, value) in env.to_vars() {
            cmd.env(key, value);
        }
        for (key, value) in &options.worker_env {
            cmd.env(key, value);
        }
        let child = cmd.spawn().map_err(|e| {
            SegTrainError::distributed(format!("failed to spawn worker {local_rank}: {e}"))
        })?;
        tracing::info!(rank = env.world.rank, local_rank, pid = child.id(), "spawned worker");
        children.push((env.world.rank, child));
    }

    let mut failed = Vec::new();
    for (rank, mut child) in children {
        let status = child.wait().await?;
        if !status.success() {
            tracing::error!(rank, %status, "worker exited with failure");
            failed.push(rank);
        }
    }
    if failed.is_empty() {
        Ok(())
    } else {
        Err(SegTrainError::distributed(format!(
            "workers {failed:?} exited with a failure status"
        )))
    }
}
