//! Process-group handle and collectives shared by the training workers.
//!
//! A world of one uses [`Comm::Local`], where every collective is the
//! identity. Larger worlds use a TCP hub rooted at rank 0.

pub mod launch;
pub mod tcp;

use crate::error::{Result, SegTrainError};
use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};
use std::sync::Arc;

pub use launch::{LaunchOptions, WorkerEnv, free_local_port, launch};
pub use tcp::TcpGroup;

/// Position of this process in the distributed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct World {
    pub world_size: usize,
    pub rank: usize,
    pub local_rank: usize,
    pub machine_rank: usize,
    pub num_workers_per_machine: usize,
}

impl World {
    pub fn single() -> Self {
        Self {
            world_size: 1,
            rank: 0,
            local_rank: 0,
            machine_rank: 0,
            num_workers_per_machine: 1,
        }
    }

    pub fn is_main_process(&self) -> bool {
        self.rank == 0
    }

    pub fn is_distributed(&self) -> bool {
        self.world_size > 1
    }
}

#[derive(Clone)]
pub enum Comm {
    Local,
    Tcp(Arc<TcpGroup>),
}

impl Comm {
    pub fn world_size(&self) -> usize {
        match self {
            Comm::Local => 1,
            Comm::Tcp(group) => group.world_size(),
        }
    }

    pub fn rank(&self) -> usize {
        match self {
            Comm::Local => 0,
            Comm::Tcp(group) => group.rank(),
        }
    }

    pub async fn barrier(&self) -> Result<()> {
        match self {
            Comm::Local => Ok(()),
            Comm::Tcp(group) => group.barrier().await,
        }
    }

    /// Replace `values` with their element-wise mean over all ranks.
    pub async fn all_reduce_mean(&self, values: &mut [f32]) -> Result<()> {
        match self {
            Comm::Local => Ok(()),
            Comm::Tcp(group) => group.all_reduce_mean(values).await,
        }
    }

    /// Rank 0's `data` on every rank; other ranks' input is ignored.
    pub async fn broadcast(&self, data: Bytes) -> Result<Bytes> {
        match self {
            Comm::Local => Ok(data),
            Comm::Tcp(group) => group.broadcast(data).await,
        }
    }

    /// Every rank's `data` in rank order on rank 0; empty elsewhere.
    pub async fn gather(&self, data: Bytes) -> Result<Vec<Bytes>> {
        match self {
            Comm::Local => Ok(vec![data]),
            Comm::Tcp(group) => group.gather(data).await,
        }
    }

    pub async fn gather_json<T: Serialize + DeserializeOwned>(&self, value: &T) -> Result<Vec<T>> {
        let payload = Bytes::from(serde_json::to_vec(value)?);
        self.gather(payload)
            .await?
            .iter()
            .map(|b| serde_json::from_slice(b).map_err(SegTrainError::from))
            .collect()
    }

    pub async fn broadcast_json<T: Serialize + DeserializeOwned>(&self, value: &T) -> Result<T> {
        let payload = Bytes::from(serde_json::to_vec(value)?);
        let out = self.broadcast(payload).await?;
        Ok(serde_json::from_slice(&out)?)
    }
}

impl std::fmt::Debug for Comm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Comm::Local => write!(f, "Comm::Local"),
            Comm::Tcp(group) => write!(
                f,
                "Comm::Tcp(rank {}/{})",
                group.rank(),
                group.world_size()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_collectives_are_identity() {
        let comm = Comm::Local;
        let mut values = [1.0, 2.0];
        comm.all_reduce_mean(&mut values).await.unwrap();
        assert_eq!(values, [1.0, 2.0]);
        comm.barrier().await.unwrap();
        assert_eq!(comm.gather_json(&7u32).await.unwrap(), vec![7]);
        assert_eq!(comm.broadcast_json(&"x".to_string()).await.unwrap(), "x");
    }

    #[test]
    fn test_main_process_is_rank_zero() {
        let world = World::single();
        assert!(world.is_main_process());
        assert!(!world.is_distributed());
    }
}
