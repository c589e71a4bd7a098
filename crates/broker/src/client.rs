//! Clients for the broker's worker and operator sockets.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use futures::{SinkExt, StreamExt};
use serde::{Serialize, de::DeserializeOwned};
use tokio::{net::UnixStream, time::timeout};
use tokio_util::codec::{Framed, LinesCodec};

use crate::{
    approval::{DEFAULT_APPROVAL_TIMEOUT, PendingApprovalInfo},
    error::ClientError,
    ipc::{
        CredentialRequestFrame, CredentialResponseFrame, MAX_FRAME_LENGTH, OperatorCommand,
        OperatorReply, ResponseStatus,
    },
};

/// Default timeout for connecting, sending and the first response frame.
pub const DEFAULT_CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Default wait for the terminal frame after a `pending` frame.
pub const DEFAULT_PENDING_TIMEOUT: Duration =
    Duration::from_secs(DEFAULT_APPROVAL_TIMEOUT.as_secs() + 30);

type Result<T> = std::result::Result<T, ClientError>;

struct LineConnection {
    framed: Framed<UnixStream, LinesCodec>,
    timeout: Duration,
}

impl LineConnection {
    async fn connect(path: &Path, io_timeout: Duration) -> Result<Self> {
        let stream = timeout(io_timeout, UnixStream::connect(path))
            .await
            .map_err(|_| ClientError::Timeout)?
            .map_err(|source| ClientError::Connect { path: PathBuf::from(path), source })?;
        Ok(Self {
            framed: Framed::new(stream, LinesCodec::new_with_max_length(MAX_FRAME_LENGTH)),
            timeout: io_timeout,
        })
    }

    async fn send<T: Serialize>(&mut self, message: &T) -> Result<()> {
        let line = serde_json::to_string(message)?;
        timeout(self.timeout, self.framed.send(line))
            .await
            .map_err(|_| ClientError::Timeout)?
            .map_err(|e| ClientError::Transport(e.to_string()))
    }

    async fn receive<T: DeserializeOwned>(&mut self, wait: Duration) -> Result<T> {
        let line = timeout(wait, self.framed.next())
            .await
            .map_err(|_| ClientError::Timeout)?
            .ok_or(ClientError::ConnectionClosed)?
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        Ok(serde_json::from_str(&line)?)
    }
}

/// Worker-side connection to the broker.
///
/// ```no_run
/// use sentra_broker::{client::BrokerClient, ipc::CredentialRequestFrame};
///
/// # async fn run() -> Result<(), sentra_broker::error::ClientError> {
/// let mut client = BrokerClient::connect("/run/sentra/broker.sock").await?;
/// let response = client
///     .request(&CredentialRequestFrame {
///         request_id: "req-1".into(),
///         worker_id: "worker-1".into(),
///         task_id: None,
///         service: "github".into(),
///         operation: "read".into(),
///         target: "acme/widgets".into(),
///         params: None,
///     })
///     .await?;
/// println!("{:?}", response.status);
/// # Ok(())
/// # }
/// ```
pub struct BrokerClient {
    connection: LineConnection,
    pending_timeout: Duration,
}

impl std::fmt::Debug for BrokerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerClient")
            .field("timeout", &self.connection.timeout)
            .field("pending_timeout", &self.pending_timeout)
            .finish_non_exhaustive()
    }
}

impl BrokerClient {
    /// Connects with [`DEFAULT_CLIENT_TIMEOUT`].
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Connect`] or [`ClientError::Timeout`].
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        Self::connect_with_timeout(path, DEFAULT_CLIENT_TIMEOUT).await
    }

    /// Connects, using `io_timeout` for the connect, each send and the first
    /// response frame.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Connect`] or [`ClientError::Timeout`].
    pub async fn connect_with_timeout(path: impl AsRef<Path>, io_timeout: Duration) -> Result<Self> {
        let connection = LineConnection::connect(path.as_ref(), io_timeout).await?;
        Ok(Self { connection, pending_timeout: DEFAULT_PENDING_TIMEOUT })
    }

    /// Sets how long to wait for the terminal frame once a request is pending.
    #[must_use]
    pub fn with_pending_timeout(mut self, pending_timeout: Duration) -> Self {
        self.pending_timeout = pending_timeout;
        self
    }

    /// Sends a request and waits for its terminal response, skipping any
    /// `pending` frame.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] on transport failure, timeout or a malformed
    /// frame. Denials and upstream failures are normal responses.
    pub async fn request(&mut self, frame: &CredentialRequestFrame) -> Result<CredentialResponseFrame> {
        self.connection.send(frame).await?;

        let mut wait = self.connection.timeout;
        loop {
            let response: CredentialResponseFrame = self.connection.receive(wait).await?;
            if response.request_id != frame.request_id {
                tracing::debug!(request_id = %response.request_id, "ignoring frame for another request");
                continue;
            }
            if response.status == ResponseStatus::Pending {
                tracing::info!(request_id = %frame.request_id, "request awaiting operator approval");
                wait = self.pending_timeout;
                continue;
            }
            return Ok(response);
        }
    }
}

/// Operator-side connection to the broker.
pub struct OperatorClient {
    connection: LineConnection,
}

impl std::fmt::Debug for OperatorClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperatorClient").field("timeout", &self.connection.timeout).finish()
    }
}

impl OperatorClient {
    /// Connects with [`DEFAULT_CLIENT_TIMEOUT`].
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Connect`] or [`ClientError::Timeout`].
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let connection = LineConnection::connect(path.as_ref(), DEFAULT_CLIENT_TIMEOUT).await?;
        Ok(Self { connection })
    }

    /// Lists requests awaiting approval, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] on transport failure or if the broker rejects
    /// the command.
    pub async fn list_pending(&mut self) -> Result<Vec<PendingApprovalInfo>> {
        match self.roundtrip(&OperatorCommand::ListPending).await? {
            OperatorReply::Pending { requests } => Ok(requests),
            other => Err(unexpected(&other)),
        }
    }

    /// Approves or denies a parked request.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Rejected`] with code `approval_not_found` if
    /// nothing is pending under `approval_id`.
    pub async fn resolve(
        &mut self,
        approval_id: &str,
        approve: bool,
        reason: Option<String>,
        operator: &str,
    ) -> Result<()> {
        let command = OperatorCommand::Resolve {
            approval_id: approval_id.to_owned(),
            approve,
            reason,
            operator: operator.to_owned(),
        };
        match self.roundtrip(&command).await? {
            OperatorReply::Resolved { .. } => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    async fn roundtrip(&mut self, command: &OperatorCommand) -> Result<OperatorReply> {
        self.connection.send(command).await?;
        let wait = self.connection.timeout;
        self.connection.receive(wait).await
    }
}

fn unexpected(reply: &OperatorReply) -> ClientError {
    match reply {
        OperatorReply::Error { code, message } => {
            ClientError::Rejected { code: code.clone(), message: message.clone() }
        },
        other => ClientError::Transport(format!("unexpected reply: {other:?}")),
    }
}
