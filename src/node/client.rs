//! Peer gRPC client helpers
//!
//! One lazily-connected channel per peer address, shared by every caller.
//! Deadlines follow the transport contract: 2 s for control traffic, 60 s
//! for replication batches and snapshot packets.

use crate::common::{Error, Result};
use crate::proto::kv_node_client::KvNodeClient;
use crate::proto::{
    AppendEntriesRequest, AppendEntriesResponse, CleanBinlogRequest, CleanBinlogResponse,
    InstallSnapshotRequest, InstallSnapshotResponse, KeepAliveRequest, KeepAliveResponse,
    ShowStatusRequest, ShowStatusResponse, VoteRequest, VoteResponse,
};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tonic::transport::{Channel, Endpoint};

/// Control-plane deadline: votes, heartbeats, status, forwards
pub const CONTROL_RPC_TIMEOUT: Duration = Duration::from_secs(2);
/// Bulk deadline: replication batches and snapshot packets
pub const REPLICATION_RPC_TIMEOUT: Duration = Duration::from_secs(60);

/// Channel cache keyed by peer address
#[derive(Default)]
pub struct PeerClients {
    channels: Mutex<HashMap<String, Channel>>,
}

impl PeerClients {
    pub fn new() -> Self {
        Self::default()
    }

    fn client(&self, addr: &str) -> Result<KvNodeClient<Channel>> {
        let mut channels = self.channels.lock().unwrap();
        if let Some(channel) = channels.get(addr) {
            return Ok(KvNodeClient::new(channel.clone()));
        }
        let endpoint = Endpoint::from_shared(format!("http://{}", addr))
            .map_err(|e| Error::ConnectionFailed(format!("{}: {}", addr, e)))?
            .connect_timeout(CONTROL_RPC_TIMEOUT);
        let channel = endpoint.connect_lazy();
        channels.insert(addr.to_string(), channel.clone());
        Ok(KvNodeClient::new(channel))
    }

    async fn call<T, F>(addr: &str, deadline: Duration, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<tonic::Response<T>, tonic::Status>>,
    {
        match tokio::time::timeout(deadline, fut).await {
            Ok(Ok(resp)) => Ok(resp.into_inner()),
            Ok(Err(status)) => Err(Error::Grpc(status)),
            Err(_) => Err(Error::Timeout(addr.to_string())),
        }
    }

    pub async fn vote(&self, addr: &str, req: VoteRequest) -> Result<VoteResponse> {
        let mut client = self.client(addr)?;
        Self::call(addr, CONTROL_RPC_TIMEOUT, client.vote(req)).await
    }

    pub async fn append_entries(
        &self,
        addr: &str,
        req: AppendEntriesRequest,
        deadline: Duration,
    ) -> Result<AppendEntriesResponse> {
        let mut client = self.client(addr)?;
        Self::call(addr, deadline, client.append_entries(req)).await
    }

    pub async fn install_snapshot(
        &self,
        addr: &str,
        req: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        let mut client = self.client(addr)?;
        Self::call(addr, REPLICATION_RPC_TIMEOUT, client.install_snapshot(req)).await
    }

    pub async fn keep_alive(&self, addr: &str, req: KeepAliveRequest) -> Result<KeepAliveResponse> {
        let mut client = self.client(addr)?;
        Self::call(addr, CONTROL_RPC_TIMEOUT, client.keep_alive(req)).await
    }

    pub async fn show_status(&self, addr: &str) -> Result<ShowStatusResponse> {
        let mut client = self.client(addr)?;
        Self::call(addr, CONTROL_RPC_TIMEOUT, client.show_status(ShowStatusRequest {})).await
    }

    pub async fn clean_binlog(
        &self,
        addr: &str,
        req: CleanBinlogRequest,
    ) -> Result<CleanBinlogResponse> {
        let mut client = self.client(addr)?;
        Self::call(addr, CONTROL_RPC_TIMEOUT, client.clean_binlog(req)).await
    }
}
