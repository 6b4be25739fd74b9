use std::{collections::HashMap, pin::Pin, sync::Arc, time::Duration};

use futures::{future, Sink, SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use solana_sdk::signature::{Keypair, Signer};
use tokio::{
    sync::{oneshot, Mutex as AsyncMutex},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::probe::Prober;
use crate::{
    config::AgentConfig,
    error::{AppError, AppResult, ProtocolError},
    hub::protocol::{
        encode, reply_message, signup_message, AgentInbound, SignupRequest, SignupResponse,
        ValidateRequest, ValidateResponse, SIGNUP, VALIDATE,
    },
    settlement::transfer::keypair_from_base58,
    signature::sign_message,
};

/// Outbound half of the hub socket, already speaking text frames
pub type FrameSink = Pin<Box<dyn Sink<String, Error = ProtocolError> + Send>>;

/// One live connection to the hub.
///
/// Writes go through a single async mutex so frames never interleave; reads
/// happen on the listener task, which hands probe work to spawned tasks and
/// correlates handshake replies through a local callback map.
pub struct AgentLink {
    keypair: Arc<Keypair>,
    public_key: String,
    sink: AsyncMutex<FrameSink>,
    validator_id: RwLock<Option<Uuid>>,
    pending_signups: Mutex<HashMap<String, oneshot::Sender<SignupResponse>>>,
    prober: Arc<Prober>,
}

impl AgentLink {
    pub fn new(keypair: Arc<Keypair>, sink: FrameSink, prober: Arc<Prober>) -> Arc<Self> {
        Arc::new(Self {
            public_key: keypair.pubkey().to_string(),
            keypair,
            sink: AsyncMutex::new(sink),
            validator_id: RwLock::new(None),
            pending_signups: Mutex::new(HashMap::new()),
            prober,
        })
    }

    pub fn validator_id(&self) -> Option<Uuid> {
        *self.validator_id.read()
    }

    async fn send_frame(&self, frame: String) -> Result<(), ProtocolError> {
        self.sink.lock().await.send(frame).await
    }

    /// Prove key ownership and wait for the hub to assign a validator id
    pub async fn signup(&self, ip: &str, timeout: Duration) -> AppResult<Uuid> {
        let callback_id = Uuid::new_v4().to_string();
        let (waiter, reply) = oneshot::channel();
        self.pending_signups
            .lock()
            .insert(callback_id.clone(), waiter);

        let frame = encode(
            SIGNUP,
            &SignupRequest {
                ip: ip.to_string(),
                public_key: self.public_key.clone(),
                signed_message: sign_message(
                    &self.keypair,
                    &signup_message(&callback_id, &self.public_key),
                ),
                callback_id: callback_id.clone(),
            },
        )?;

        if let Err(e) = self.send_frame(frame).await {
            self.pending_signups.lock().remove(&callback_id);
            return Err(e.into());
        }

        match tokio::time::timeout(timeout, reply).await {
            Ok(Ok(response)) => Ok(response.validator_id),
            Ok(Err(_)) => Err(ProtocolError::ConnectionClosed.into()),
            Err(_) => {
                self.pending_signups.lock().remove(&callback_id);
                Err(ProtocolError::HandshakeTimeout.into())
            }
        }
    }

    /// Handle one inbound frame without blocking the read loop
    pub fn handle_frame(self: &Arc<Self>, text: &str) -> Result<(), ProtocolError> {
        match AgentInbound::from_text(text)? {
            AgentInbound::Signup(response) => {
                let waiter = self.pending_signups.lock().remove(&response.callback_id);
                match waiter {
                    Some(waiter) => {
                        *self.validator_id.write() = Some(response.validator_id);
                        let _ = waiter.send(response);
                    }
                    None => debug!("Ignoring unsolicited signup reply {}", response.callback_id),
                }
            }
            AgentInbound::Validate(request) => {
                let link = self.clone();
                tokio::spawn(async move {
                    let callback_id = request.callback_id.clone();
                    if let Err(e) = link.answer_probe(request).await {
                        warn!("⚠️  Could not answer probe {}: {}", callback_id, e);
                    }
                });
            }
        }
        Ok(())
    }

    /// Probe the target and send back a signed result
    pub async fn answer_probe(&self, request: ValidateRequest) -> AppResult<()> {
        let outcome = self.prober.probe(&request.url).await;
        let validator_id = self.validator_id().ok_or_else(|| {
            AppError::Internal("probe received before the handshake completed".to_string())
        })?;

        let frame = encode(
            VALIDATE,
            &ValidateResponse {
                signed_message: sign_message(&self.keypair, &reply_message(&request.callback_id)),
                callback_id: request.callback_id,
                status: outcome.status,
                latency: outcome.latency_ms,
                validator_id,
                website_id: request.website_id,
            },
        )?;
        self.send_frame(frame).await?;

        debug!(
            "Probed {} -> {} in {} ms",
            request.url, outcome.status, outcome.latency_ms
        );
        Ok(())
    }
}

/// An authenticated hub connection and its read loop
pub struct AgentConnection {
    pub validator_id: Uuid,
    pub link: Arc<AgentLink>,
    listener: JoinHandle<()>,
}

impl AgentConnection {
    /// Resolves when the hub closes the socket
    pub async fn closed(self) {
        let _ = self.listener.await;
    }

    pub fn close(&self) {
        self.listener.abort();
    }
}

/// Validator process: connects, signs up, answers probes, reconnects
pub struct ValidatorAgent {
    keypair: Arc<Keypair>,
    config: AgentConfig,
    prober: Arc<Prober>,
}

impl ValidatorAgent {
    pub fn new(keypair: Keypair, config: AgentConfig) -> AppResult<Self> {
        let prober = Prober::new(Duration::from_secs(config.probe_timeout_secs))?;
        Ok(Self {
            keypair: Arc::new(keypair),
            config,
            prober: Arc::new(prober),
        })
    }

    pub fn from_config(config: AgentConfig) -> AppResult<Self> {
        let keypair = keypair_from_base58(&config.private_key)?;
        Self::new(keypair, config)
    }

    pub fn public_key(&self) -> String {
        self.keypair.pubkey().to_string()
    }

    pub async fn connect(&self) -> AppResult<AgentConnection> {
        let (stream, _) = connect_async(self.config.hub_url.as_str())
            .await
            .map_err(|e| ProtocolError::Transport(e.to_string()))?;
        let (sink, mut source) = stream.split();

        let sink: FrameSink = Box::pin(
            sink.sink_map_err(|e| ProtocolError::Transport(e.to_string()))
                .with(|frame: String| future::ready(Ok::<_, ProtocolError>(Message::Text(frame)))),
        );
        let link = AgentLink::new(self.keypair.clone(), sink, self.prober.clone());

        let reader = link.clone();
        let listener = tokio::spawn(async move {
            while let Some(message) = source.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        if let Err(e) = reader.handle_frame(&text) {
                            warn!("⚠️  Bad frame from hub: {}", e);
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!("⚠️  Hub socket error: {}", e);
                        break;
                    }
                }
            }
        });

        let handshake_timeout = Duration::from_secs(self.config.handshake_timeout_secs);
        match link.signup(&self.config.agent_ip, handshake_timeout).await {
            Ok(validator_id) => Ok(AgentConnection {
                validator_id,
                link,
                listener,
            }),
            Err(e) => {
                listener.abort();
                Err(e)
            }
        }
    }

    /// Stay connected forever, backing off between failed attempts
    pub async fn run(&self) -> AppResult<()> {
        let max_backoff = Duration::from_secs(self.config.reconnect_max_backoff_secs);
        let mut failures: u32 = 0;

        loop {
            match self.connect().await {
                Ok(connection) => {
                    failures = 0;
                    info!(
                        "✅ Connected to hub {} as validator {}",
                        self.config.hub_url, connection.validator_id
                    );
                    connection.closed().await;
                    warn!("🔌 Hub connection closed");
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    warn!("⚠️  Could not connect to hub (attempt {}): {}", failures, e);
                }
            }

            let delay = backoff_delay(failures, max_backoff);
            debug!("Reconnecting in {:?}", delay);
            tokio::time::sleep(delay).await;
        }
    }
}

/// Exponential backoff from one second, capped, plus up to 250 ms jitter
pub fn backoff_delay(failures: u32, max: Duration) -> Duration {
    let exponent = failures.saturating_sub(1).min(16);
    let base = Duration::from_secs(1u64 << exponent).min(max);
    base + Duration::from_millis(rand::random_range(0..250))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        hub::protocol::Envelope,
        ledger::models::TickStatus,
        signature::{Ed25519Verifier, SignatureVerifier},
    };
    use futures::channel::mpsc;

    fn link() -> (Arc<AgentLink>, Arc<Keypair>, mpsc::UnboundedReceiver<String>) {
        let keypair = Arc::new(Keypair::new());
        let (tx, rx) = mpsc::unbounded::<String>();
        let sink: FrameSink =
            Box::pin(tx.sink_map_err(|e| ProtocolError::Transport(e.to_string())));
        let prober = Arc::new(Prober::new(Duration::from_millis(500)).unwrap());
        (AgentLink::new(keypair.clone(), sink, prober), keypair, rx)
    }

    async fn complete_signup(
        link: &Arc<AgentLink>,
        rx: &mut mpsc::UnboundedReceiver<String>,
        validator_id: Uuid,
    ) -> SignupRequest {
        let signing = {
            let link = link.clone();
            tokio::spawn(async move { link.signup("10.1.1.1", Duration::from_secs(5)).await })
        };

        let sent: SignupRequest = Envelope::parse(&rx.next().await.unwrap())
            .unwrap()
            .decode()
            .unwrap();
        let response = encode(
            SIGNUP,
            &SignupResponse {
                validator_id,
                callback_id: sent.callback_id.clone(),
            },
        )
        .unwrap();
        link.handle_frame(&response).unwrap();

        assert_eq!(signing.await.unwrap().unwrap(), validator_id);
        sent
    }

    #[tokio::test]
    async fn test_signup_is_signed_and_correlated() {
        let (link, keypair, mut rx) = link();
        let validator_id = Uuid::new_v4();

        let sent = complete_signup(&link, &mut rx, validator_id).await;

        assert_eq!(sent.public_key, keypair.pubkey().to_string());
        assert_eq!(sent.ip, "10.1.1.1");
        Ed25519Verifier
            .verify_signature(
                &sent.signed_message,
                &signup_message(&sent.callback_id, &sent.public_key),
                &sent.public_key,
            )
            .unwrap();
        assert_eq!(link.validator_id(), Some(validator_id));
    }

    #[tokio::test]
    async fn test_signup_times_out_without_reply() {
        let (link, _keypair, _rx) = link();
        let result = link.signup("10.1.1.1", Duration::from_millis(30)).await;
        assert!(matches!(
            result,
            Err(AppError::Protocol(ProtocolError::HandshakeTimeout))
        ));
        assert!(link.pending_signups.lock().is_empty());
    }

    #[tokio::test]
    async fn test_probe_request_gets_signed_reply() {
        let (link, keypair, mut rx) = link();
        let validator_id = Uuid::new_v4();
        complete_signup(&link, &mut rx, validator_id).await;

        let website_id = Uuid::new_v4();
        let request = encode(
            VALIDATE,
            &ValidateRequest {
                url: "http://127.0.0.1:1/".to_string(),
                callback_id: "cb-42".to_string(),
                website_id,
            },
        )
        .unwrap();
        link.handle_frame(&request).unwrap();

        let reply: ValidateResponse = Envelope::parse(&rx.next().await.unwrap())
            .unwrap()
            .decode()
            .unwrap();
        assert_eq!(reply.callback_id, "cb-42");
        assert_eq!(reply.status, TickStatus::Bad);
        assert_eq!(reply.validator_id, validator_id);
        assert_eq!(reply.website_id, website_id);
        Ed25519Verifier
            .verify_signature(
                &reply.signed_message,
                &reply_message("cb-42"),
                &keypair.pubkey().to_string(),
            )
            .unwrap();
    }

    #[tokio::test]
    async fn test_unsolicited_signup_reply_is_ignored() {
        let (link, _keypair, _rx) = link();
        let frame = encode(
            SIGNUP,
            &SignupResponse {
                validator_id: Uuid::new_v4(),
                callback_id: "nobody-asked".to_string(),
            },
        )
        .unwrap();
        link.handle_frame(&frame).unwrap();
        assert!(link.validator_id().is_none());
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let max = Duration::from_secs(30);
        let jitter = Duration::from_millis(250);

        let first = backoff_delay(1, max);
        assert!(first >= Duration::from_secs(1) && first < Duration::from_secs(1) + jitter);

        let fourth = backoff_delay(4, max);
        assert!(fourth >= Duration::from_secs(8) && fourth < Duration::from_secs(8) + jitter);

        let many = backoff_delay(40, max);
        assert!(many >= max && many < max + jitter);
    }
}
