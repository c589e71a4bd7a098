//! Unix socket front end for the broker.
//!
//! Two sockets are bound:
//!
//! - the **worker socket**, where sandboxed workers send
//!   [`CredentialRequestFrame`]s and receive [`CredentialResponseFrame`]s
//! - the **operator socket**, where operators list and resolve parked
//!   approvals with [`OperatorCommand`]s
//!
//! Both are created with mode `0600` inside a directory created `0700`.
//! Existing directories are used as-is; symlinked directories and
//! non-socket files at a socket path are refused. One task serves each
//! connection and concurrency is bounded by a semaphore shared by both
//! sockets.
//!
//! Requests on one worker connection are handled in order. While a request
//! is in flight the connection keeps being read: end-of-stream cancels the
//! request, and further frames are queued behind it.

use std::{
    collections::{BTreeMap, VecDeque},
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use futures::{SinkExt, StreamExt};
use sentra_common_storage::TaskId;
use tokio::{
    net::{
        UnixListener, UnixStream,
        unix::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::{Semaphore, oneshot},
};
use tokio_util::{
    codec::{Framed, FramedRead, FramedWrite, LinesCodec},
    sync::CancellationToken,
    task::TaskTracker,
};

use crate::{
    approval::{ApprovalDecision, ApprovalManager},
    broker::{CredentialBroker, CredentialRequest, PeerInfo},
    config::BrokerConfig,
    error::{CredentialError, Result},
    ipc::{
        CredentialRequestFrame, CredentialResponseFrame, MAX_FRAME_LENGTH, OperatorCommand,
        OperatorReply,
    },
};

/// Permissions for the worker socket.
pub const WORKER_SOCKET_MODE: u32 = 0o600;

/// Permissions for the operator socket.
pub const OPERATOR_SOCKET_MODE: u32 = 0o600;

/// Permissions for socket directories the broker creates.
pub const DIRECTORY_MODE: u32 = 0o700;

/// How long in-flight connections may run after shutdown starts.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

type FrameReader = FramedRead<OwnedReadHalf, LinesCodec>;
type FrameWriter = FramedWrite<OwnedWriteHalf, LinesCodec>;

/// Shared state handed to each worker connection.
#[derive(Debug, Clone)]
struct WorkerContext {
    broker: Arc<CredentialBroker>,
    workers: Arc<BTreeMap<String, String>>,
}

impl WorkerContext {
    fn to_request(&self, frame: CredentialRequestFrame, peer: Option<PeerInfo>) -> CredentialRequest {
        let role = self.workers.get(&frame.worker_id).cloned();
        CredentialRequest::builder()
            .request_id(frame.request_id)
            .worker_id(frame.worker_id)
            .maybe_task_id(frame.task_id.map(TaskId::from))
            .maybe_caller_role(role)
            .service(frame.service)
            .operation(frame.operation)
            .target(frame.target)
            .maybe_params(frame.params)
            .maybe_peer(peer)
            .build()
    }
}

/// Accepts worker and operator connections for a [`CredentialBroker`].
pub struct BrokerServer {
    context: WorkerContext,
    worker_socket: PathBuf,
    operator_socket: PathBuf,
    worker_listener: UnixListener,
    operator_listener: UnixListener,
    connection_sem: Arc<Semaphore>,
    max_connections: usize,
}

impl std::fmt::Debug for BrokerServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerServer")
            .field("worker_socket", &self.worker_socket)
            .field("operator_socket", &self.operator_socket)
            .field("max_connections", &self.max_connections)
            .finish_non_exhaustive()
    }
}

impl BrokerServer {
    /// Binds both sockets.
    ///
    /// Must be called within a Tokio runtime context.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::Io`] if a socket directory cannot be
    /// prepared, a stale socket cannot be removed, a socket cannot be bound
    /// or its permissions cannot be set.
    pub fn bind(config: &BrokerConfig, broker: Arc<CredentialBroker>) -> Result<Self> {
        if let Some(parent) = config.worker_socket.parent() {
            ensure_directory(parent)?;
        }
        if let Some(parent) = config.operator_socket.parent()
            && config.operator_socket.parent() != config.worker_socket.parent()
        {
            ensure_directory(parent)?;
        }

        cleanup_socket(&config.worker_socket)?;
        cleanup_socket(&config.operator_socket)?;

        let worker_listener = bind_socket(&config.worker_socket, "worker", WORKER_SOCKET_MODE)?;
        let operator_listener =
            bind_socket(&config.operator_socket, "operator", OPERATOR_SOCKET_MODE)?;

        tracing::info!(
            worker_socket = %config.worker_socket.display(),
            operator_socket = %config.operator_socket.display(),
            max_connections = config.max_connections,
            "broker sockets bound"
        );

        Ok(Self {
            context: WorkerContext { broker, workers: Arc::new(config.workers.clone()) },
            worker_socket: config.worker_socket.clone(),
            operator_socket: config.operator_socket.clone(),
            worker_listener,
            operator_listener,
            connection_sem: Arc::new(Semaphore::new(config.max_connections)),
            max_connections: config.max_connections,
        })
    }

    /// Path of the worker socket.
    #[must_use]
    pub fn worker_socket_path(&self) -> &Path {
        &self.worker_socket
    }

    /// Path of the operator socket.
    #[must_use]
    pub fn operator_socket_path(&self) -> &Path {
        &self.operator_socket
    }

    /// Serves connections until `shutdown` is cancelled, then waits up to
    /// [`SHUTDOWN_GRACE`] for open connections and removes the socket files.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::Io`] if the socket files cannot be removed.
    pub async fn serve(&self, shutdown: CancellationToken) -> Result<()> {
        let tracker = TaskTracker::new();

        loop {
            let permit = tokio::select! {
                () = shutdown.cancelled() => break,
                permit = Arc::clone(&self.connection_sem).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            tokio::select! {
                () = shutdown.cancelled() => break,
                result = self.worker_listener.accept() => match result {
                    Ok((stream, _addr)) => {
                        let context = self.context.clone();
                        let token = shutdown.child_token();
                        tracker.spawn(async move {
                            let _permit = permit;
                            handle_worker(stream, context, token).await;
                        });
                    },
                    Err(e) => tracing::warn!(error = %e, "failed to accept worker connection"),
                },
                result = self.operator_listener.accept() => match result {
                    Ok((stream, _addr)) => {
                        let approvals = Arc::clone(self.context.broker.approvals());
                        let token = shutdown.child_token();
                        tracker.spawn(async move {
                            let _permit = permit;
                            handle_operator(stream, approvals, token).await;
                        });
                    },
                    Err(e) => tracing::warn!(error = %e, "failed to accept operator connection"),
                },
            }
        }

        tracing::info!(open_connections = tracker.len(), "broker server shutting down");
        tracker.close();
        if tokio::time::timeout(SHUTDOWN_GRACE, tracker.wait()).await.is_err() {
            tracing::warn!(open_connections = tracker.len(), "connections still open after grace period");
        }
        self.cleanup()
    }

    /// Removes both socket files.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::Io`] listing every file that could not be
    /// removed.
    pub fn cleanup(&self) -> Result<()> {
        let mut errors = Vec::new();
        for path in [&self.worker_socket, &self.operator_socket] {
            if path.exists() {
                if let Err(e) = std::fs::remove_file(path) {
                    errors.push(format!("failed to remove socket {}: {e}", path.display()));
                } else {
                    tracing::info!(socket_path = %path.display(), "removed socket file");
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(CredentialError::io("socket cleanup", io::Error::other(errors.join("; "))))
        }
    }
}

impl Drop for BrokerServer {
    fn drop(&mut self) {
        if let Err(e) = self.cleanup() {
            tracing::warn!("failed to clean up sockets on drop: {e}");
        }
    }
}

fn bind_socket(path: &Path, kind: &str, mode: u32) -> Result<UnixListener> {
    let listener = UnixListener::bind(path).map_err(|e| {
        CredentialError::io(format!("failed to bind {kind} socket to {}", path.display()), e)
    })?;
    set_socket_permissions(path, mode)?;
    Ok(listener)
}

/// Creates `path` with [`DIRECTORY_MODE`] if missing. Existing directories
/// keep their permissions; symlinks and non-directories are refused.
fn ensure_directory(path: &Path) -> Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(metadata) => {
            if metadata.file_type().is_symlink() {
                return Err(CredentialError::io(
                    format!("{} is a symlink, refusing to use it as a socket directory", path.display()),
                    io::Error::from(io::ErrorKind::InvalidInput),
                ));
            }
            if !metadata.is_dir() {
                return Err(CredentialError::io(
                    format!("{} exists but is not a directory", path.display()),
                    io::Error::from(io::ErrorKind::AlreadyExists),
                ));
            }
            Ok(())
        },
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            std::fs::create_dir_all(path).map_err(|e| {
                CredentialError::io(format!("failed to create directory {}", path.display()), e)
            })?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(path, std::fs::Permissions::from_mode(DIRECTORY_MODE))
                    .map_err(|e| {
                        CredentialError::io(
                            format!("failed to set permissions on {}", path.display()),
                            e,
                        )
                    })?;
            }
            Ok(())
        },
        Err(e) => Err(CredentialError::io(format!("failed to stat {}", path.display()), e)),
    }
}

#[cfg(unix)]
fn set_socket_permissions(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).map_err(|e| {
        CredentialError::io(format!("failed to set socket permissions on {}", path.display()), e)
    })
}

#[cfg(not(unix))]
fn set_socket_permissions(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

/// Removes a socket left behind by a previous run.
fn cleanup_socket(path: &Path) -> Result<()> {
    let metadata = match std::fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(CredentialError::io(format!("failed to stat {}", path.display()), e)),
    };

    #[cfg(unix)]
    {
        use std::os::unix::fs::FileTypeExt;
        if !metadata.file_type().is_socket() {
            return Err(CredentialError::io(
                format!("path {} exists but is not a socket", path.display()),
                io::Error::from(io::ErrorKind::AlreadyExists),
            ));
        }
    }
    #[cfg(not(unix))]
    let _ = metadata;

    std::fs::remove_file(path).map_err(|e| {
        CredentialError::io(format!("failed to remove stale socket {}", path.display()), e)
    })?;
    tracing::debug!(path = %path.display(), "removed stale socket file");
    Ok(())
}

fn peer_info(stream: &UnixStream) -> Option<PeerInfo> {
    match stream.peer_cred() {
        Ok(cred) => Some(PeerInfo { pid: cred.pid(), uid: cred.uid(), gid: cred.gid() }),
        Err(e) => {
            tracing::debug!(error = %e, "peer credentials unavailable");
            None
        },
    }
}

async fn send_frame(writer: &mut FrameWriter, frame: &CredentialResponseFrame) -> bool {
    let line = match serde_json::to_string(frame) {
        Ok(line) => line,
        Err(e) => {
            tracing::error!(error = %e, "failed to encode response frame");
            return false;
        },
    };
    match writer.send(line).await {
        Ok(()) => true,
        Err(e) => {
            tracing::debug!(error = %e, "failed to write response frame");
            false
        },
    }
}

#[tracing::instrument(skip_all, fields(peer_pid))]
async fn handle_worker(stream: UnixStream, context: WorkerContext, shutdown: CancellationToken) {
    let peer = peer_info(&stream);
    if let Some(pid) = peer.and_then(|p| p.pid) {
        tracing::Span::current().record("peer_pid", pid);
    }
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, LinesCodec::new_with_max_length(MAX_FRAME_LENGTH));
    let mut writer = FramedWrite::new(write_half, LinesCodec::new_with_max_length(MAX_FRAME_LENGTH));
    let mut backlog = VecDeque::new();
    let mut reader_open = true;

    loop {
        let line = if let Some(line) = backlog.pop_front() {
            line
        } else if reader_open {
            tokio::select! {
                () = shutdown.cancelled() => break,
                next = reader.next() => match next {
                    Some(Ok(line)) => line,
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "unreadable worker frame, closing connection");
                        break;
                    },
                    None => break,
                },
            }
        } else {
            break;
        };

        let frame = match serde_json::from_str::<CredentialRequestFrame>(&line) {
            Ok(frame) if !frame.request_id.is_empty() => frame,
            Ok(frame) => {
                let err = CredentialError::invalid_request("request_id must not be empty");
                if !send_frame(&mut writer, &CredentialResponseFrame::from_error(frame.request_id, &err)).await {
                    break;
                }
                continue;
            },
            Err(e) => {
                tracing::warn!(error = %e, "malformed credential request frame");
                let err = CredentialError::invalid_request("malformed request frame");
                if !send_frame(&mut writer, &CredentialResponseFrame::from_error("", &err)).await {
                    break;
                }
                continue;
            },
        };

        let request = context.to_request(frame, peer);
        let connected = run_request(
            &context.broker,
            request,
            &mut reader,
            &mut reader_open,
            &mut writer,
            &mut backlog,
        )
        .await;
        if !connected {
            break;
        }
    }
    tracing::debug!("worker connection closed");
}

/// Runs one request while watching the connection. Returns `false` once the
/// worker is gone.
async fn run_request(
    broker: &CredentialBroker,
    request: CredentialRequest,
    reader: &mut FrameReader,
    reader_open: &mut bool,
    writer: &mut FrameWriter,
    backlog: &mut VecDeque<String>,
) -> bool {
    let request_id = request.request_id.clone();
    let cancel = CancellationToken::new();
    let (pending_tx, mut pending_rx) = oneshot::channel();
    let mut pending_done = false;
    let mut connected = true;

    let in_flight = broker.request_credential_notify(request, cancel.clone(), Some(pending_tx));
    tokio::pin!(in_flight);

    let outcome = loop {
        tokio::select! {
            outcome = &mut in_flight => break outcome,
            parked = &mut pending_rx, if !pending_done => {
                pending_done = true;
                if parked.is_ok()
                    && !send_frame(writer, &CredentialResponseFrame::pending(&request_id)).await
                {
                    connected = false;
                    cancel.cancel();
                }
            },
            next = reader.next(), if *reader_open => match next {
                Some(Ok(line)) => backlog.push_back(line),
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "unreadable worker frame, canceling request");
                    *reader_open = false;
                    connected = false;
                    cancel.cancel();
                },
                None => {
                    *reader_open = false;
                    connected = false;
                    cancel.cancel();
                },
            },
        }
    };

    if !connected {
        return false;
    }
    let frame = match outcome {
        Ok(result) => CredentialResponseFrame::approved(request_id, result),
        Err(e) => CredentialResponseFrame::from_error(request_id, &e),
    };
    send_frame(writer, &frame).await
}

async fn handle_operator(
    stream: UnixStream,
    approvals: Arc<ApprovalManager>,
    shutdown: CancellationToken,
) {
    let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_FRAME_LENGTH));
    loop {
        let line = tokio::select! {
            () = shutdown.cancelled() => break,
            next = framed.next() => match next {
                Some(Ok(line)) => line,
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "unreadable operator frame, closing connection");
                    break;
                },
                None => break,
            },
        };

        let reply = match serde_json::from_str::<OperatorCommand>(&line) {
            Ok(command) => dispatch_operator(&approvals, command).await,
            Err(e) => OperatorReply::Error { code: "invalid_request".to_owned(), message: e.to_string() },
        };
        let encoded = match serde_json::to_string(&reply) {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::error!(error = %e, "failed to encode operator reply");
                break;
            },
        };
        if let Err(e) = framed.send(encoded).await {
            tracing::debug!(error = %e, "failed to write operator reply");
            break;
        }
    }
}

async fn dispatch_operator(approvals: &ApprovalManager, command: OperatorCommand) -> OperatorReply {
    match command {
        OperatorCommand::ListPending => OperatorReply::Pending { requests: approvals.list_pending() },
        OperatorCommand::Resolve { approval_id, approve, reason, operator } => {
            if operator.trim().is_empty() {
                return (&CredentialError::invalid_request("operator must not be empty")).into();
            }
            let decision = if approve {
                ApprovalDecision::approved(operator)
            } else {
                ApprovalDecision::denied(operator, reason)
            };
            match approvals.resolve(&approval_id, decision).await {
                Ok(()) => OperatorReply::Resolved { approval_id },
                Err(e) => (&e).into(),
            }
        },
    }
}
