use crate::{
    field_of_play::{FopCommand, FopHandle},
    registry::Registry,
};
use lift_common::{
    event_bus::{SessionId, Subscription, SubscriptionFilter},
    events::{Event, Topic},
    session::SessionManager,
};
use log::*;
use serde::{Deserialize, Serialize};
use std::{fmt::Debug, net::SocketAddr, sync::Arc};
use thiserror::Error;
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream, ToSocketAddrs},
    select,
    sync::mpsc,
    task::{self, JoinHandle},
    time::{Duration, Instant, interval, timeout},
};

const TIMEOUT: Duration = Duration::from_millis(2000);
const WORKER_CHANNEL_LEN: usize = 16;
const IDLE_CHECK_PERIOD: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
enum SessionRequest {
    Attach {
        fop: String,
        #[serde(default)]
        topics: Option<Vec<Topic>>,
        #[serde(default)]
        referee: Option<u8>,
    },
    Reattach {
        session: SessionId,
    },
    Detach,
    Ping,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
struct CommandRequest {
    fop: String,
    #[serde(flatten)]
    command: FopCommand,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Request {
    Session(SessionRequest),
    Command(CommandRequest),
}

impl Request {
    fn parse(line: &str) -> Result<Self, ServerError> {
        let value: serde_json::Value = serde_json::from_str(line)?;
        match value.get("type").and_then(|t| t.as_str()) {
            Some("attach" | "reattach" | "detach" | "ping") => {
                Ok(Request::Session(serde_json::from_value(value)?))
            }
            Some(_) => Ok(Request::Command(serde_json::from_value(value)?)),
            None => Err(ServerError::MissingType),
        }
    }
}

/// One line written back to a client
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
enum Outgoing<'a> {
    Ok(serde_json::Value),
    Error(String),
    Event(&'a Event),
}

impl Outgoing<'_> {
    fn encode(&self) -> Option<Vec<u8>> {
        match serde_json::to_vec(self) {
            Ok(mut bytes) => {
                bytes.push(b'\n');
                Some(bytes)
            }
            Err(e) => {
                error!("Could not encode {self:?}: {e}");
                None
            }
        }
    }
}

#[derive(Debug, Error)]
enum ServerError {
    #[error("Malformed request: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Request has no type")]
    MissingType,
    #[error("No field of play named {0:?}")]
    UnknownFop(String),
    #[error("This connection is not attached to a field of play")]
    NotAttached,
    #[error("This connection is already attached as session {0}")]
    AlreadyAttached(SessionId),
    #[error(transparent)]
    Session(#[from] lift_common::session::SessionError),
    #[error(transparent)]
    FieldOfPlay(#[from] crate::field_of_play::FieldOfPlayError),
}

#[derive(Debug, Error)]
enum WorkerError {
    #[error("The sender closed the channel")]
    ChannelClosed,
    #[error(transparent)]
    IoError(#[from] io::Error),
}

async fn worker_loop<T: AsyncWrite + Debug + Unpin + Send>(
    mut rx: mpsc::Receiver<Vec<u8>>,
    mut write: T,
) -> Result<(), WorkerError> {
    loop {
        let data = rx.recv().await.ok_or(WorkerError::ChannelClosed)?;

        match timeout(TIMEOUT, write.write_all(&data[..])).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!("Send to {:?} failed: {e:?}", write);
                Err(e)?;
            }
            Err(_) => {
                warn!("Send to {:?} timed out", write);
            }
        }
    }
}

/// Forwards bus events to the connection's writer until the session is
/// unsubscribed. Each forwarded event counts as activity on the session.
async fn forward_loop(
    mut subscription: Subscription,
    sessions: SessionManager,
    out: mpsc::Sender<Vec<u8>>,
) {
    let id = subscription.id();
    while let Some(event) = subscription.recv().await {
        let Some(bytes) = Outgoing::Event(event.as_ref()).encode() else {
            continue;
        };
        if out.send(bytes).await.is_err() {
            break;
        }
        if let Err(e) = sessions.touch(id) {
            debug!("Could not touch session {id}: {e}");
        }
    }
    trace!("Forwarding for session {id} ended");
}

struct Connection {
    peer: SocketAddr,
    registry: Arc<Registry>,
    sessions: SessionManager,
    out: mpsc::Sender<Vec<u8>>,
    attached: Option<(SessionId, JoinHandle<()>)>,
}

impl Connection {
    async fn send(&self, msg: Outgoing<'_>) -> bool {
        match msg.encode() {
            Some(bytes) => self.out.send(bytes).await.is_ok(),
            None => true,
        }
    }

    fn fop(&self, name: &str) -> Result<&FopHandle, ServerError> {
        self.registry
            .get(name)
            .ok_or_else(|| ServerError::UnknownFop(name.to_string()))
    }

    /// Sends the current state before any live events, so a late joiner starts
    /// from a full picture
    async fn start_forwarding(
        &mut self,
        fop: FopHandle,
        subscription: Subscription,
        wants_snapshot: bool,
    ) {
        let id = subscription.id();
        if wants_snapshot {
            match fop.snapshot().await {
                Ok(snapshot) => {
                    let event = Event::Snapshot {
                        snapshot: Box::new(snapshot),
                    };
                    self.send(Outgoing::Event(&event)).await;
                }
                Err(e) => warn!("No initial snapshot for session {id}: {e}"),
            }
        }
        let join = task::spawn(forward_loop(
            subscription,
            self.sessions.clone(),
            self.out.clone(),
        ));
        self.attached = Some((id, join));
    }

    async fn handle_session(
        &mut self,
        request: SessionRequest,
    ) -> Result<serde_json::Value, ServerError> {
        match request {
            SessionRequest::Ping => Ok(serde_json::json!("pong")),
            SessionRequest::Attach {
                fop,
                topics,
                referee,
            } => {
                if let Some((id, _)) = &self.attached {
                    return Err(ServerError::AlreadyAttached(*id));
                }
                let fop = self.fop(&fop)?.clone();
                let mut filter = match topics {
                    Some(topics) => SubscriptionFilter::topics(topics),
                    None => SubscriptionFilter::all_topics(),
                };
                filter.referee = referee;
                let wants_snapshot = filter.topics.contains(&Topic::Snapshot);

                let subscription = self.sessions.attach(fop.bus(), filter);
                let id = subscription.id();
                info!("{} attached to {} as session {id}", self.peer, fop.name());
                self.send(Outgoing::Ok(serde_json::json!({ "session": id })))
                    .await;
                self.start_forwarding(fop, subscription, wants_snapshot)
                    .await;
                Ok(serde_json::Value::Null)
            }
            SessionRequest::Reattach { session } => {
                if let Some((id, _)) = &self.attached {
                    return Err(ServerError::AlreadyAttached(*id));
                }
                let record = self
                    .sessions
                    .get(session)
                    .ok_or(lift_common::session::SessionError::UnknownSession(session))?;
                let fop = self.fop(&record.fop_name)?.clone();
                let wants_snapshot = record.filter.topics.contains(&Topic::Snapshot);
                let subscription = self.sessions.reattach(session)?;
                info!("{} reattached session {session}", self.peer);
                self.send(Outgoing::Ok(serde_json::json!({ "session": session })))
                    .await;
                self.start_forwarding(fop, subscription, wants_snapshot)
                    .await;
                Ok(serde_json::Value::Null)
            }
            SessionRequest::Detach => {
                let (id, join) = self.attached.take().ok_or(ServerError::NotAttached)?;
                self.sessions.hard_detach(id);
                join.abort();
                Ok(serde_json::json!({ "session": id }))
            }
        }
    }

    async fn handle_line(&mut self, line: &str) {
        if let Some((id, _)) = &self.attached {
            if let Err(e) = self.sessions.touch(*id) {
                debug!("Could not touch session {id}: {e}");
            }
        }

        let result = match Request::parse(line) {
            Ok(Request::Session(request)) => self.handle_session(request).await,
            Ok(Request::Command(CommandRequest { fop, command })) => match self.fop(&fop) {
                Ok(handle) => handle
                    .command(command)
                    .await
                    .map_err(ServerError::from)
                    .and_then(|status| serde_json::to_value(status).map_err(ServerError::from)),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };

        match result {
            // Attach replies are sent before the initial snapshot
            Ok(serde_json::Value::Null) => {}
            Ok(value) => {
                self.send(Outgoing::Ok(value)).await;
            }
            Err(e) => {
                debug!("Request from {} failed: {e}", self.peer);
                self.send(Outgoing::Error(e.to_string())).await;
            }
        }
    }

    fn disconnected(&mut self) {
        if let Some((id, join)) = self.attached.take() {
            join.abort();
            if let Err(e) = self.sessions.soft_detach(id) {
                debug!("Session {id} was already gone: {e}");
            }
        }
    }
}

async fn connection_loop(
    stream: TcpStream,
    peer: SocketAddr,
    registry: Arc<Registry>,
    sessions: SessionManager,
) {
    let (read, write) = stream.into_split();
    let (tx, rx) = mpsc::channel(WORKER_CHANNEL_LEN);
    let writer = task::spawn(worker_loop(rx, write));

    let mut conn = Connection {
        peer,
        registry,
        sessions,
        out: tx,
        attached: None,
    };

    let mut lines = BufReader::new(read).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => {}
            Ok(Some(line)) => conn.handle_line(&line).await,
            Ok(None) => {
                info!("{peer} disconnected");
                break;
            }
            Err(e) => {
                warn!("Read from {peer} failed: {e}");
                break;
            }
        }
    }

    conn.disconnected();
    drop(conn);
    match writer.await {
        Ok(Err(WorkerError::ChannelClosed)) | Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("Writer for {peer} ended: {e}"),
        Err(e) => debug!("Writer for {peer} was cancelled: {e}"),
    }
}

/// Accepts referee panels, operator consoles and local displays. Every line in
/// is a JSON request, every line out is a reply or an event.
pub struct CommandServer {
    listener: TcpListener,
    registry: Arc<Registry>,
    sessions: SessionManager,
}

impl CommandServer {
    pub async fn bind<A: ToSocketAddrs>(
        addr: A,
        registry: Arc<Registry>,
        sessions: SessionManager,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("Command server listening on {:?}", listener.local_addr()?);
        Ok(Self {
            listener,
            registry,
            sessions,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) {
        let mut idle_check = interval(IDLE_CHECK_PERIOD);
        loop {
            select! {
                conn = self.listener.accept() => match conn {
                    Ok((stream, peer)) => {
                        info!("New connection from {peer:?}");
                        task::spawn(connection_loop(
                            stream,
                            peer,
                            self.registry.clone(),
                            self.sessions.clone(),
                        ));
                    }
                    Err(e) => error!("Accepting a connection failed: {e:?}"),
                },
                _ = idle_check.tick() => {
                    let expired = self.sessions.expire_idle(Instant::now());
                    if !expired.is_empty() {
                        info!("Expired idle sessions {expired:?}");
                    }
                }
            }
        }
    }
}
