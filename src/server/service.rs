//! Server Service Loop
//!
//! Accepts client connections on a Unix socket and funnels their queries to
//! a single handler task.

use std::future::Future;
use std::path::{Path, PathBuf};

use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

use super::handler::{HandlerStats, QueryHandler, Session, SessionStep};
use super::ServerConfig;
use crate::adapters::unix_socket::{message_codec, recv_frame, send_frame, MessageFrames};
use crate::domain::{HostEnv, Message};
use crate::error::{Error, Result};

/// A query on its way to the handler task
struct Request {
    message: Message,
    cwd: String,
    reply: oneshot::Sender<Message>,
}

/// Bound server, ready to accept connections
pub struct Server {
    listener: UnixListener,
    socket_path: PathBuf,
    requests: mpsc::Sender<Request>,
    handler_task: JoinHandle<HandlerStats>,
}

impl Server {
    /// Bind the socket and start the handler task
    pub fn bind<E>(config: &ServerConfig, handler: QueryHandler<E>) -> Result<Self>
    where
        E: HostEnv + 'static,
    {
        let socket_path = config.socket_path.clone();
        if socket_path.exists() {
            debug!(path = %socket_path.display(), "Removing stale socket");
            std::fs::remove_file(&socket_path)?;
        }
        let listener = UnixListener::bind(&socket_path)?;

        let (requests, queue) = mpsc::channel(config.queue_depth.max(1));
        let handler_task = tokio::task::spawn_blocking(move || handler_loop(handler, queue));

        info!(path = %socket_path.display(), "Server listening");
        Ok(Self {
            listener,
            socket_path,
            requests,
            handler_task,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Serve until `shutdown` completes. Returns the handler's counters.
    pub async fn run_until<F>(self, shutdown: F) -> Result<HandlerStats>
    where
        F: Future<Output = ()>,
    {
        let Server {
            listener,
            socket_path,
            requests,
            handler_task,
        } = self;
        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => {
                    let (stream, _) = accepted?;
                    let requests = requests.clone();
                    connections.spawn(async move {
                        if let Err(e) = connection(stream, requests).await {
                            warn!(error = %e, "Connection closed with error");
                        }
                    });
                }
                Some(finished) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = finished {
                        error!(error = %e, "Connection task failed");
                    }
                }
            }
        }

        info!(open = connections.len(), "Shutting down server");
        connections.shutdown().await;
        drop(requests);
        let stats = handler_task
            .await
            .map_err(|e| Error::Internal(format!("handler task failed: {}", e)))?;
        if let Err(e) = std::fs::remove_file(&socket_path) {
            debug!(path = %socket_path.display(), error = %e, "Socket already removed");
        }
        info!(
            requests = stats.requests,
            relocations = stats.relocations,
            errors = stats.errors,
            "Server stopped"
        );
        Ok(stats)
    }
}

/// Run a server from configuration until Ctrl-C
pub async fn serve<E>(config: &ServerConfig, env: E) -> Result<HandlerStats>
where
    E: HostEnv + 'static,
{
    let handler = QueryHandler::new(config, env)?;
    let server = Server::bind(config, handler)?;
    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
        })
        .await
}

fn handler_loop<E: HostEnv>(
    mut handler: QueryHandler<E>,
    mut queue: mpsc::Receiver<Request>,
) -> HandlerStats {
    while let Some(request) = queue.blocking_recv() {
        let answer = handler.handle(request.message, &request.cwd);
        if request.reply.send(answer).is_err() {
            debug!("Client went away before its answer");
        }
    }
    handler.stats()
}

async fn connection(stream: UnixStream, requests: mpsc::Sender<Request>) -> Result<()> {
    let mut frames: MessageFrames<UnixStream> = Framed::new(stream, message_codec());
    let mut session = Session::default();

    while let Some(message) = recv_frame(&mut frames).await? {
        let query = match session.step(message) {
            Ok(SessionStep::Query(query)) => query,
            Ok(SessionStep::Updated) => continue,
            Ok(SessionStep::Close) => break,
            Err(e) => {
                send_frame(&mut frames, &Message::ErrorAnswer { reason: e.to_string() }).await?;
                continue;
            }
        };

        let (reply, answer) = oneshot::channel();
        requests
            .send(Request {
                message: query,
                cwd: session.cwd().to_string(),
                reply,
            })
            .await
            .map_err(|_| Error::Internal("handler task stopped".into()))?;
        let answer = answer
            .await
            .map_err(|_| Error::Internal("handler dropped the request".into()))?;
        send_frame(&mut frames, &answer).await?;
    }
    debug!(cwd = session.cwd(), "Session ended");
    Ok(())
}
