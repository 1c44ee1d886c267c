// ============================================================================
// File: src/backends/remote/mod.rs
// ----------------------------------------------------------------------------
// RemoteCache backend: client leaf that lets several processes on one host
// share a single cache backend running inside a separate daemon, over two
// unary calls on a local unix socket.
// ============================================================================

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request};
use hyper_client_sockets::connector::UnixConnector;
use hyper_client_sockets::tokio::TokioBackend;
use hyper_client_sockets::uri::UnixUri;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::de::DeserializeOwned;
use tokio::time::timeout;

use crate::config::VMConfig;
use crate::error::{FactoryError, FactoryResult};
use crate::hypervisor::VmmHandles;
use crate::vm::{Vm, VmSnapshotHandle};

pub mod server;

type HttpClient = Client<UnixConnector<TokioBackend>, Full<Bytes>>;

const CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Client side of the remote cache
///
/// The wire contract is two unary calls: `GET /config` returning the
/// server's [`VMConfig`] and `PUT /base-vm` returning a serialized
/// [`VmSnapshotHandle`] reconstructed locally over this process's own
/// collaborator handles. No status call exists on the wire.
///
/// The client keeps one pooled connection for its whole lifetime, so a
/// single instance serves any number of `get_base_vm` calls.
#[derive(Debug)]
pub struct RemoteCacheBackend {
    client: HttpClient,
    socket_path: PathBuf,
    config: VMConfig,
    handles: VmmHandles,
}

impl RemoteCacheBackend {
    /// Connect to the cache daemon listening on `socket_path`
    ///
    /// Fetches the remote config eagerly; a daemon that does not answer
    /// fails construction rather than the first `get_base_vm`.
    pub async fn new(socket_path: PathBuf, handles: VmmHandles) -> FactoryResult<Self> {
        let connector = UnixConnector::<TokioBackend>::new();
        let client = Client::builder(TokioExecutor::new()).build(connector);

        let config: VMConfig =
            Self::call(&client, &socket_path, Method::GET, "/config", "config").await?;

        Ok(Self {
            client,
            socket_path,
            config,
            handles,
        })
    }

    async fn call<T: DeserializeOwned>(
        client: &HttpClient,
        socket_path: &PathBuf,
        method: Method,
        path: &str,
        call: &'static str,
    ) -> FactoryResult<T> {
        let uri = hyper::Uri::unix(socket_path, path)
            .map_err(|e| FactoryError::rpc(call, format!("failed to build request: {e}")))?;
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("Content-Type", "application/json")
            .body(Full::new(Bytes::new()))
            .map_err(|e| FactoryError::rpc(call, format!("failed to build request: {e}")))?;

        let response = timeout(CALL_TIMEOUT, client.request(request))
            .await
            .map_err(|_| FactoryError::rpc(call, "request timed out"))?
            .map_err(|e| FactoryError::rpc(call, format!("request failed: {e}")))?;

        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| FactoryError::rpc(call, format!("failed to read response body: {e}")))?
            .to_bytes();

        if !status.is_success() {
            let details = String::from_utf8_lossy(&body);
            return Err(FactoryError::rpc(
                call,
                format!("server answered {status}: {details}"),
            ));
        }

        serde_json::from_slice(&body)
            .map_err(|e| FactoryError::rpc(call, format!("failed to decode response: {e}")))
    }
}

#[async_trait]
impl super::trait_def::BaseVmBackend for RemoteCacheBackend {
    fn config(&self) -> VMConfig {
        self.config.clone()
    }

    async fn get_base_vm(&self, _config: &VMConfig) -> FactoryResult<Vm> {
        let handle: VmSnapshotHandle = Self::call(
            &self.client,
            &self.socket_path,
            Method::PUT,
            "/base-vm",
            "get_base_vm",
        )
        .await?;

        Ok(Vm::from_handle(handle, &self.handles))
    }

    async fn close(&self) -> FactoryResult<()> {
        // Nothing persisted on this side; the daemon owns the pool.
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "remote-cache"
    }
}
