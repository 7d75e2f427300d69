use crate::{config::Relay, field_of_play::FopHandle};
use lift_common::{
    event_bus::{EventBus, SessionId, Subscription, SubscriptionFilter},
    events::Topic,
    snapshot::{RELAY_UPDATE_PATH, StateSnapshot},
};
use log::*;
use reqwest::{Client, ClientBuilder};
use thiserror::Error;
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::{self, JoinHandle},
    time::{Duration, timeout},
};

const DELIVERY_CHANNEL_LEN: usize = 4;

/// Bus id of the publisher's own subscription. Display sessions are numbered
/// upwards from 1 and never reach it.
pub const PUBLISHER_ID: SessionId = SessionId::MAX;

/// Pushes a fresh snapshot of one platform to the relay tier every time the
/// rankings change. Delivery is best effort: a snapshot that can't be queued
/// or delivered in time is dropped.
#[derive(Debug)]
pub struct RelayPublisher {
    bus: EventBus,
    tx: mpsc::Sender<StateSnapshot>,
    worker_join: JoinHandle<()>,
    trigger_join: JoinHandle<()>,
}

impl RelayPublisher {
    /// The trigger subscription lives on the bus directly and is never expired
    pub fn new(settings: &Relay, fop: FopHandle) -> Result<Self, RelayError> {
        let client = ClientBuilder::new().timeout(settings.timeout()).build()?;
        let url = format!(
            "{}{RELAY_UPDATE_PATH}",
            settings.url.trim_end_matches('/')
        );
        info!("Publishing field of play {} to {url}", fop.name());

        let (tx, rx) = mpsc::channel(DELIVERY_CHANNEL_LEN);
        let worker_join = task::spawn(delivery_loop(client, url, settings.timeout(), rx));

        let bus = fop.bus().clone();
        let subscription = bus.subscribe(
            PUBLISHER_ID,
            SubscriptionFilter::topics([Topic::GlobalRankingUpdated]),
        );
        let trigger_join = task::spawn(trigger_loop(fop, subscription, tx.clone()));

        Ok(Self {
            bus,
            tx,
            worker_join,
            trigger_join,
        })
    }

    /// Never waits. Hands the snapshot back if the worker is busy or gone.
    pub fn publish(&self, snapshot: StateSnapshot) -> Result<(), TrySendError<StateSnapshot>> {
        self.tx.try_send(snapshot)
    }
}

impl Drop for RelayPublisher {
    fn drop(&mut self) {
        self.bus.unsubscribe(PUBLISHER_ID);
        self.trigger_join.abort();
        self.worker_join.abort();
    }
}

async fn trigger_loop(
    fop: FopHandle,
    mut subscription: Subscription,
    tx: mpsc::Sender<StateSnapshot>,
) {
    while subscription.recv().await.is_some() {
        let snapshot = match fop.snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("Stopping relay publishing: {e}");
                return;
            }
        };
        match tx.try_send(snapshot) {
            Ok(()) => {}
            Err(TrySendError::Full(snapshot)) => {
                warn!(
                    "Relay delivery is backed up, dropping snapshot {} of {}",
                    snapshot.sequence, snapshot.fop_name
                );
            }
            Err(TrySendError::Closed(_)) => {
                error!("Relay delivery worker has stopped");
                return;
            }
        }
    }
    debug!("Relay trigger subscription for {} ended", fop.name());
}

async fn delivery_loop(
    client: Client,
    url: String,
    deadline: Duration,
    mut rx: mpsc::Receiver<StateSnapshot>,
) {
    while let Some(snapshot) = rx.recv().await {
        match deliver(&client, &url, &snapshot, deadline).await {
            Ok(body) => debug!(
                "Relay accepted snapshot {} of {}: {body}",
                snapshot.sequence, snapshot.fop_name
            ),
            Err(e) => warn!(
                "Dropping snapshot {} of {}: {e}",
                snapshot.sequence, snapshot.fop_name
            ),
        }
    }
}

/// Returns the body of the relay's answer, which is otherwise not interpreted
pub async fn deliver(
    client: &Client,
    url: &str,
    snapshot: &StateSnapshot,
    deadline: Duration,
) -> Result<String, RelayError> {
    let request = async {
        let response = client.post(url).json(snapshot).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if status.is_success() {
            Ok(body)
        } else {
            Err(RelayError::Status(status.as_u16(), body))
        }
    };

    timeout(deadline, request)
        .await
        .map_err(|_| RelayError::Timeout(deadline))?
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("No answer from the relay within {0:?}")]
    Timeout(Duration),
    #[error("The relay answered with status {0}: {1}")]
    Status(u16, String),
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::field_of_play::{FopCommand, test::spawn_fop};
    use lift_common::{config::SessionSettings, events::Ruling, session::SessionManager};
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
        sync::mpsc::UnboundedSender,
    };

    fn header_end(buf: &[u8]) -> Option<usize> {
        buf.windows(4).position(|w| w == b"\r\n\r\n")
    }

    /// Accepts one request per connection and answers `status` with a short body
    async fn fake_relay(listener: TcpListener, status: &'static str, tx: UnboundedSender<Vec<u8>>) {
        loop {
            let (mut stream, _) = listener.accept().await.unwrap();
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut buf = vec![];
                let mut chunk = [0u8; 4096];
                loop {
                    let n = stream.read(&mut chunk).await.unwrap();
                    if n == 0 {
                        return;
                    }
                    buf.extend_from_slice(&chunk[..n]);
                    let Some(end) = header_end(&buf) else {
                        continue;
                    };
                    let headers = String::from_utf8_lossy(&buf[..end]).to_lowercase();
                    let len: usize = headers
                        .lines()
                        .find_map(|l| l.strip_prefix("content-length:"))
                        .map(|v| v.trim().parse().unwrap())
                        .unwrap_or(0);
                    if buf.len() >= end + 4 + len {
                        tx.send(buf[end + 4..end + 4 + len].to_vec()).unwrap();
                        let answer = format!(
                            "HTTP/1.1 {status}\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok"
                        );
                        stream.write_all(answer.as_bytes()).await.unwrap();
                        return;
                    }
                }
            });
        }
    }

    async fn start_fake_relay(status: &'static str) -> (String, mpsc::UnboundedReceiver<Vec<u8>>) {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(fake_relay(listener, status, tx));
        (url, rx)
    }

    #[tokio::test]
    async fn test_decision_pushes_snapshot() {
        let (url, mut bodies) = start_fake_relay("200 OK").await;
        let fop = spawn_fop("A");
        let _publisher = RelayPublisher::new(
            &Relay {
                url,
                timeout_ms: 2000,
            },
            fop.clone(),
        )
        .unwrap();
        assert!(fop.bus().is_subscribed(PUBLISHER_ID));

        for (referee, ruling) in [(1, Ruling::Good), (2, Ruling::Bad), (3, Ruling::Good)] {
            fop.command(FopCommand::SubmitVote { referee, ruling })
                .await
                .unwrap();
        }

        let body = bodies.recv().await.unwrap();
        let snapshot = StateSnapshot::decode(&body).unwrap();
        assert_eq!(snapshot.fop_name, "A");
        assert_eq!(snapshot.sequence, 1);
        assert_eq!(snapshot.decision.unwrap().result, Ruling::Good);
        assert!(snapshot.hidden);
    }

    #[tokio::test]
    async fn test_publishing_survives_idle_sweep() {
        let (url, mut bodies) = start_fake_relay("200 OK").await;
        let fop = spawn_fop("A");
        let sessions = SessionManager::new(SessionSettings {
            grace_secs: 5,
            idle_timeout_secs: 0,
        });
        let display = sessions.attach(fop.bus(), SubscriptionFilter::all_topics());
        let _publisher = RelayPublisher::new(
            &Relay {
                url,
                timeout_ms: 2000,
            },
            fop.clone(),
        )
        .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(sessions.expire_idle(tokio::time::Instant::now()), vec![display.id()]);
        assert!(fop.bus().is_subscribed(PUBLISHER_ID));

        for referee in 1..=3 {
            fop.command(FopCommand::SubmitVote {
                referee,
                ruling: Ruling::Good,
            })
            .await
            .unwrap();
        }

        let body = timeout(Duration::from_secs(3), bodies.recv())
            .await
            .unwrap()
            .unwrap();
        let snapshot = StateSnapshot::decode(&body).unwrap();
        assert_eq!(snapshot.decision.unwrap().result, Ruling::Good);
    }

    #[tokio::test]
    async fn test_error_status_is_reported() {
        let (url, mut bodies) = start_fake_relay("500 Internal Server Error").await;
        let client = Client::new();
        let result = deliver(
            &client,
            &format!("{url}{RELAY_UPDATE_PATH}"),
            &StateSnapshot::default(),
            Duration::from_secs(2),
        )
        .await;

        match result {
            Err(RelayError::Status(500, body)) => assert_eq!(body, "ok"),
            other => panic!("Expected a status error, got {other:?}"),
        }
        assert!(bodies.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_silent_relay_times_out() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let url = format!("http://{}{RELAY_UPDATE_PATH}", listener.local_addr().unwrap());
        let _hold = tokio::spawn(async move {
            let mut conns = vec![];
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                conns.push(stream);
            }
        });

        let deadline = Duration::from_millis(200);
        let result = deliver(&Client::new(), &url, &StateSnapshot::default(), deadline).await;
        assert!(matches!(result, Err(RelayError::Timeout(d)) if d == deadline));
    }
}
