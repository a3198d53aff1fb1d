//! gRPC surface: translates the wire protocol into [`crate::node::api`]
//! calls and the internal consensus handlers

use crate::node::server::Node;
use crate::proto::kv_node_server::{KvNode, KvNodeServer};
use crate::proto::*;
use crate::storage::{LogEntry, LogOp as DomainLogOp};
use std::sync::Arc;
use tonic::{Request, Response, Status};

impl From<&LogEntry> for Entry {
    fn from(entry: &LogEntry) -> Self {
        let op = match entry.op {
            DomainLogOp::Nop => LogOp::Nop,
            DomainLogOp::Put => LogOp::Put,
            DomainLogOp::Del => LogOp::Del,
            DomainLogOp::Lock => LogOp::Lock,
            DomainLogOp::Unlock => LogOp::Unlock,
            DomainLogOp::Login => LogOp::Login,
            DomainLogOp::Logout => LogOp::Logout,
            DomainLogOp::Register => LogOp::Register,
            DomainLogOp::AddNode => LogOp::AddNode,
        };
        Entry {
            term: entry.term,
            op: op as i32,
            key: entry.key.clone(),
            value: entry.value.clone(),
            user: entry.user.clone(),
        }
    }
}

impl From<&Entry> for LogEntry {
    fn from(entry: &Entry) -> Self {
        let op = match entry.op() {
            LogOp::Nop => DomainLogOp::Nop,
            LogOp::Put => DomainLogOp::Put,
            LogOp::Del => DomainLogOp::Del,
            LogOp::Lock => DomainLogOp::Lock,
            LogOp::Unlock => DomainLogOp::Unlock,
            LogOp::Login => DomainLogOp::Login,
            LogOp::Logout => DomainLogOp::Logout,
            LogOp::Register => DomainLogOp::Register,
            LogOp::AddNode => DomainLogOp::AddNode,
        };
        LogEntry {
            term: entry.term,
            op,
            key: entry.key.clone(),
            value: entry.value.clone(),
            user: entry.user.clone(),
        }
    }
}

/// The node's gRPC service
pub struct NodeService {
    node: Arc<Node>,
}

impl NodeService {
    pub fn new(node: Arc<Node>) -> Self {
        Self { node }
    }

    /// Converts this service into a gRPC server instance.
    pub fn into_server(self) -> KvNodeServer<Self> {
        KvNodeServer::new(self)
    }
}

#[tonic::async_trait]
impl KvNode for NodeService {
    async fn show_status(
        &self,
        _request: Request<ShowStatusRequest>,
    ) -> Result<Response<ShowStatusResponse>, Status> {
        Ok(Response::new(self.node.show_status()))
    }

    async fn vote(
        &self,
        request: Request<VoteRequest>,
    ) -> Result<Response<VoteResponse>, Status> {
        Ok(Response::new(self.node.handle_vote(&request.into_inner())))
    }

    async fn append_entries(
        &self,
        request: Request<AppendEntriesRequest>,
    ) -> Result<Response<AppendEntriesResponse>, Status> {
        Ok(Response::new(
            self.node.handle_append_entries(&request.into_inner()),
        ))
    }

    async fn install_snapshot(
        &self,
        request: Request<InstallSnapshotRequest>,
    ) -> Result<Response<InstallSnapshotResponse>, Status> {
        Ok(Response::new(
            self.node.handle_install_snapshot(&request.into_inner()),
        ))
    }

    async fn put(&self, request: Request<PutRequest>) -> Result<Response<PutResponse>, Status> {
        let request = request.into_inner();
        Ok(Response::new(
            self.node.put(request.key, request.value, request.uuid).await,
        ))
    }

    async fn del(&self, request: Request<DelRequest>) -> Result<Response<DelResponse>, Status> {
        let request = request.into_inner();
        Ok(Response::new(self.node.del(request.key, request.uuid).await))
    }

    async fn get(&self, request: Request<GetRequest>) -> Result<Response<GetResponse>, Status> {
        let request = request.into_inner();
        Ok(Response::new(self.node.get(request.key, request.uuid).await))
    }

    async fn scan(&self, request: Request<ScanRequest>) -> Result<Response<ScanResponse>, Status> {
        let request = request.into_inner();
        Ok(Response::new(self.node.scan(
            request.start_key,
            request.end_key,
            request.size_limit,
            request.uuid,
        )))
    }

    async fn lock(&self, request: Request<LockRequest>) -> Result<Response<LockResponse>, Status> {
        let request = request.into_inner();
        Ok(Response::new(
            self.node
                .lock(request.key, request.session_id, request.uuid)
                .await,
        ))
    }

    async fn unlock(
        &self,
        request: Request<UnlockRequest>,
    ) -> Result<Response<UnlockResponse>, Status> {
        let request = request.into_inner();
        Ok(Response::new(
            self.node
                .unlock(request.key, request.session_id, request.uuid)
                .await,
        ))
    }

    async fn keep_alive(
        &self,
        request: Request<KeepAliveRequest>,
    ) -> Result<Response<KeepAliveResponse>, Status> {
        Ok(Response::new(self.node.keep_alive(&request.into_inner())))
    }

    async fn watch(
        &self,
        request: Request<WatchRequest>,
    ) -> Result<Response<WatchResponse>, Status> {
        Ok(Response::new(self.node.watch(&request.into_inner()).await))
    }

    async fn login(
        &self,
        request: Request<LoginRequest>,
    ) -> Result<Response<LoginResponse>, Status> {
        let request = request.into_inner();
        Ok(Response::new(
            self.node.login(request.username, request.passwd).await,
        ))
    }

    async fn logout(
        &self,
        request: Request<LogoutRequest>,
    ) -> Result<Response<LogoutResponse>, Status> {
        let request = request.into_inner();
        Ok(Response::new(self.node.logout(request.uuid).await))
    }

    async fn register(
        &self,
        request: Request<RegisterRequest>,
    ) -> Result<Response<RegisterResponse>, Status> {
        let request = request.into_inner();
        Ok(Response::new(
            self.node.register(request.username, request.passwd).await,
        ))
    }

    async fn add_node(
        &self,
        request: Request<AddNodeRequest>,
    ) -> Result<Response<AddNodeResponse>, Status> {
        let request = request.into_inner();
        Ok(Response::new(self.node.add_node(request.node_addr).await))
    }

    async fn remove_node(
        &self,
        request: Request<RemoveNodeRequest>,
    ) -> Result<Response<RemoveNodeResponse>, Status> {
        let request = request.into_inner();
        Ok(Response::new(self.node.remove_node(request.node_addr)))
    }

    async fn clean_binlog(
        &self,
        request: Request<CleanBinlogRequest>,
    ) -> Result<Response<CleanBinlogResponse>, Status> {
        let request = request.into_inner();
        Ok(Response::new(self.node.handle_clean_binlog(request.end_index)))
    }

    async fn rpc_stat(
        &self,
        request: Request<RpcStatRequest>,
    ) -> Result<Response<RpcStatResponse>, Status> {
        Ok(Response::new(self.node.rpc_stat(&request.into_inner())))
    }
}
