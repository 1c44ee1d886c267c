// ============================================================================
// File: src/backends/remote/server.rs
// ----------------------------------------------------------------------------
// Serving side of the remote cache: a unix-socket HTTP server exposing one
// cache backend to every factory process on the host. Runs inside the
// long-lived cache daemon.
// ============================================================================

use std::convert::Infallible;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::net::UnixListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::backends::cache::CacheBackend;
use crate::backends::trait_def::BaseVmBackend;
use crate::error::{FactoryError, FactoryResult};

/// Unix-socket server wrapping one [`CacheBackend`]
///
/// Serves the client wire contract (`GET /config`, `PUT /base-vm`) plus a
/// local-only `GET /status` diagnostic that is not part of the contract.
#[derive(Debug)]
pub struct RemoteCacheServer {
    socket_path: PathBuf,
    cache: Arc<CacheBackend>,
    shutdown: watch::Sender<bool>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl RemoteCacheServer {
    /// Bind `socket_path` and start serving `cache`
    ///
    /// A stale socket file from a previous run is removed first.
    pub fn bind(socket_path: PathBuf, cache: Arc<CacheBackend>) -> FactoryResult<Self> {
        if socket_path.exists() {
            fs::remove_file(&socket_path).map_err(|e| {
                FactoryError::storage(format!(
                    "failed to remove stale socket {}: {e}",
                    socket_path.display()
                ))
            })?;
        }

        let listener = UnixListener::bind(&socket_path).map_err(|e| {
            FactoryError::backend_failed(
                "remote-cache-server",
                format!("failed to bind {}: {e}", socket_path.display()),
            )
        })?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let accept_task = tokio::spawn(Self::accept_loop(listener, cache.clone(), shutdown_rx));

        log::info!("remote cache serving on {}", socket_path.display());
        Ok(Self {
            socket_path,
            cache,
            shutdown,
            accept_task: Mutex::new(Some(accept_task)),
        })
    }

    async fn accept_loop(
        listener: UnixListener,
        cache: Arc<CacheBackend>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            let stream = tokio::select! {
                biased;
                _ = shutdown_rx.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        log::warn!("remote cache accept failed: {e}");
                        continue;
                    }
                },
            };

            let cache = cache.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req| handle(cache.clone(), req));
                if let Err(e) = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await
                {
                    log::debug!("remote cache connection ended: {e}");
                }
            });
        }
    }

    /// Stop accepting, close the wrapped cache, remove the socket file
    pub async fn shutdown(&self) -> FactoryResult<()> {
        let _ = self.shutdown.send(true);

        let task = self
            .accept_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                log::warn!("remote cache accept task aborted: {e}");
            }
        }

        if let Err(e) = fs::remove_file(&self.socket_path) {
            log::warn!(
                "failed to remove socket {}: {e}",
                self.socket_path.display()
            );
        }

        self.cache.close().await
    }
}

async fn handle(
    cache: Arc<CacheBackend>,
    req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/config") => json_response(&cache.config()),
        (&Method::PUT, "/base-vm") => {
            // Ownership of the popped VM moves to the requesting process;
            // only its serialized handle crosses the wire.
            match cache.get_base_vm(&cache.config()).await {
                Ok(vm) => json_response(&vm.to_handle()),
                Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e),
            }
        }
        (&Method::GET, "/status") => match cache.vm_status() {
            Ok(statuses) => json_response(&statuses),
            Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e),
        },
        _ => plain_response(StatusCode::NOT_FOUND, Bytes::from_static(b"unknown call")),
    };

    Ok(response)
}

fn json_response<T: Serialize>(value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(value) {
        Ok(body) => {
            let mut response = plain_response(StatusCode::OK, Bytes::from(body));
            response.headers_mut().insert(
                hyper::header::CONTENT_TYPE,
                hyper::header::HeaderValue::from_static("application/json"),
            );
            response
        }
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e),
    }
}

fn error_response<E: std::fmt::Display>(status: StatusCode, error: &E) -> Response<Full<Bytes>> {
    plain_response(status, Bytes::from(error.to_string()))
}

fn plain_response(status: StatusCode, body: Bytes) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    response
}
