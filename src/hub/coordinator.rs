use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use tokio::time::{interval_at, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::{
    callbacks::{CallbackHandler, CallbackOutcome, CallbackTable},
    protocol::{
        encode, reply_message, signup_message, CallbackRef, Envelope, SignupRequest,
        SignupResponse, ValidateRequest, ValidateResponse, SIGNUP, VALIDATE,
    },
    registry::{ConnectionRegistry, Outbound, ValidatorConnection},
};
use crate::{
    config::HubConfig,
    error::{AppResult, ProtocolError},
    ledger::{
        models::{NewTick, Tick},
        LedgerStore,
    },
    signature::SignatureVerifier,
};

/// One socket as seen by the hub, authenticated or not
pub struct Session {
    pub id: Uuid,
    outbound: Outbound,
    validator_id: Option<Uuid>,
}

impl Session {
    pub fn validator_id(&self) -> Option<Uuid> {
        self.validator_id
    }
}

/// What the hub expects back for one dispatched probe
#[derive(Debug, Clone)]
pub struct ProbeExpectation {
    pub callback_id: String,
    pub target_id: Uuid,
    pub validator_id: Uuid,
    pub public_key: String,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchSummary {
    pub targets: usize,
    pub validators: usize,
    pub dispatched: usize,
    pub failed_sends: usize,
}

/// Coordinator: owns the live connections and the outstanding probes
pub struct Hub {
    ledger: Arc<dyn LedgerStore>,
    verifier: Arc<dyn SignatureVerifier>,
    registry: ConnectionRegistry,
    callbacks: CallbackTable,
    reward_per_check: i64,
}

impl Hub {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        verifier: Arc<dyn SignatureVerifier>,
        config: &HubConfig,
    ) -> Self {
        Self {
            ledger,
            verifier,
            registry: ConnectionRegistry::new(),
            callbacks: CallbackTable::new(config.callback_ttl()),
            reward_per_check: config.reward_per_check,
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn callbacks(&self) -> &CallbackTable {
        &self.callbacks
    }

    pub fn open_session(&self, outbound: Outbound) -> Session {
        Session {
            id: Uuid::new_v4(),
            outbound,
            validator_id: None,
        }
    }

    /// Route one inbound text frame
    pub async fn handle_frame(&self, session: &mut Session, text: &str) -> AppResult<()> {
        let envelope = Envelope::parse(text)?;
        match envelope.kind.as_str() {
            SIGNUP => {
                let request: SignupRequest = envelope.decode()?;
                self.handle_signup(session, request).await
            }
            VALIDATE => {
                let reference: CallbackRef = envelope.decode()?;
                if !self
                    .callbacks
                    .resolve(&reference.callback_id, session.id, envelope.data)
                    .await
                {
                    debug!(
                        "Ignoring reply for unknown or settled callback {}",
                        reference.callback_id
                    );
                }
                Ok(())
            }
            other => Err(ProtocolError::UnknownType(other.to_string()).into()),
        }
    }

    #[instrument(skip_all, fields(public_key = %request.public_key))]
    async fn handle_signup(&self, session: &mut Session, request: SignupRequest) -> AppResult<()> {
        let expected = signup_message(&request.callback_id, &request.public_key);
        if let Err(e) =
            self.verifier
                .verify_signature(&request.signed_message, &expected, &request.public_key)
        {
            warn!("🚫 Rejected handshake: {}", e);
            return Err(ProtocolError::HandshakeRejected {
                public_key: request.public_key,
                reason: e.to_string(),
            }
            .into());
        }

        let validator = self
            .ledger
            .upsert_validator(&request.public_key, &request.ip)
            .await?;

        // Re-signup under another key on the same socket drops the old identity
        if let Some(previous) = session.validator_id {
            if previous != validator.id {
                self.registry.remove_session(previous, session.id);
            }
        }

        // The reply is queued before registration so no validate frame can overtake it
        let frame = encode(
            SIGNUP,
            &SignupResponse {
                validator_id: validator.id,
                callback_id: request.callback_id,
            },
        )?;
        session
            .outbound
            .send(frame)
            .map_err(|_| ProtocolError::ConnectionClosed)?;

        let connection = ValidatorConnection::new(
            validator.id,
            validator.public_key.clone(),
            session.id,
            session.outbound.clone(),
        );
        if let Some(replaced) = self.registry.register(connection) {
            if replaced.session_id != session.id {
                info!(
                    "🔁 Validator {} reconnected, replacing session {}",
                    validator.id, replaced.session_id
                );
            }
        }
        session.validator_id = Some(validator.id);

        info!("✅ Validator {} connected ({})", validator.id, request.ip);
        Ok(())
    }

    /// Tear down a closed socket: unregister it unless a newer session has
    /// taken over, and fail every probe it still owed.
    pub async fn close_session(&self, session: &Session) {
        if let Some(validator_id) = session.validator_id {
            if self.registry.remove_session(validator_id, session.id) {
                info!("👋 Validator {} disconnected", validator_id);
            }
        }

        let failed = self.callbacks.fail_session(session.id).await;
        if failed > 0 {
            debug!("Dropped {} outstanding probes of session {}", failed, session.id);
        }
    }

    /// Send one probe per (active target, connected validator) pair
    #[instrument(skip(self))]
    pub async fn dispatch_cycle(&self) -> AppResult<DispatchSummary> {
        let targets = self.ledger.active_targets().await?;
        let validators = self.registry.snapshot();

        let mut summary = DispatchSummary {
            targets: targets.len(),
            validators: validators.len(),
            ..Default::default()
        };

        for target in &targets {
            for connection in &validators {
                let callback_id = Uuid::new_v4().to_string();
                let frame = encode(
                    VALIDATE,
                    &ValidateRequest {
                        url: target.url.clone(),
                        callback_id: callback_id.clone(),
                        website_id: target.id,
                    },
                )?;

                let expectation = ProbeExpectation {
                    callback_id: callback_id.clone(),
                    target_id: target.id,
                    validator_id: connection.validator_id,
                    public_key: connection.public_key.clone(),
                };
                // Registered before sending so a fast reply always finds it
                self.callbacks
                    .register(&callback_id, connection.session_id, self.probe_handler(expectation));

                match connection.send(frame) {
                    Ok(()) => summary.dispatched += 1,
                    Err(e) => {
                        self.callbacks.cancel(&callback_id);
                        summary.failed_sends += 1;
                        warn!(
                            "⚠️  Could not send probe to validator {}: {}",
                            connection.validator_id, e
                        );
                    }
                }
            }
        }

        Ok(summary)
    }

    fn probe_handler(&self, expectation: ProbeExpectation) -> CallbackHandler {
        let ledger = self.ledger.clone();
        let verifier = self.verifier.clone();
        let reward = self.reward_per_check;

        Box::new(move |outcome| {
            async move {
                match outcome {
                    CallbackOutcome::Reply(payload) => {
                        match record_probe_reply(
                            ledger.as_ref(),
                            verifier.as_ref(),
                            reward,
                            &expectation,
                            payload,
                        )
                        .await
                        {
                            Ok(tick) => debug!(
                                "Recorded {} tick for target {} from validator {} ({} ms)",
                                tick.status, tick.target_id, tick.validator_id, tick.latency_ms
                            ),
                            Err(e) => warn!(
                                "⚠️  Discarded reply {} from validator {}: {}",
                                expectation.callback_id, expectation.validator_id, e
                            ),
                        }
                    }
                    CallbackOutcome::PeerDisconnected => debug!(
                        "Validator {} disconnected before answering {}",
                        expectation.validator_id, expectation.callback_id
                    ),
                    CallbackOutcome::Expired => debug!(
                        "Probe {} to validator {} expired",
                        expectation.callback_id, expectation.validator_id
                    ),
                }
            }
            .boxed()
        })
    }

    pub async fn run_dispatch_loop(self: Arc<Self>, period: Duration) {
        let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("⏱️  Dispatching probes every {:?}", period);

        loop {
            ticker.tick().await;
            match self.dispatch_cycle().await {
                Ok(summary) => info!(
                    "📡 Dispatched {} probes ({} targets x {} validators, {} failed sends)",
                    summary.dispatched, summary.targets, summary.validators, summary.failed_sends
                ),
                Err(e) => error!("❌ Dispatch cycle failed: {}", e),
            }
        }
    }

    pub async fn run_sweeper(self: Arc<Self>, period: Duration) {
        let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            let expired = self.callbacks.sweep_expired(Instant::now()).await;
            if expired > 0 {
                debug!("Expired {} unanswered probes", expired);
            }
        }
    }
}

/// Check a probe reply against what was dispatched and record it
pub async fn record_probe_reply(
    ledger: &dyn LedgerStore,
    verifier: &dyn SignatureVerifier,
    reward: i64,
    expected: &ProbeExpectation,
    payload: Value,
) -> AppResult<Tick> {
    let reply: ValidateResponse = serde_json::from_value(payload)?;

    if reply.callback_id != expected.callback_id
        || reply.validator_id != expected.validator_id
        || reply.website_id != expected.target_id
    {
        return Err(ProtocolError::ReplyMismatch {
            validator_id: reply.validator_id,
            callback_id: expected.callback_id.clone(),
        }
        .into());
    }

    verifier.verify_signature(
        &reply.signed_message,
        &reply_message(&expected.callback_id),
        &expected.public_key,
    )?;

    ledger
        .record_tick(
            NewTick {
                target_id: expected.target_id,
                validator_id: expected.validator_id,
                status: reply.status,
                latency_ms: reply.latency,
            },
            reward,
        )
        .await
}
