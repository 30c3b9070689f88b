//! Voice swap coordinator
//!
//! Changing the voice needs a new realtime session. Capture is suppressed from
//! the moment a swap starts until the assistant has finished introducing
//! itself in the new voice, so nothing the user says lands in a half-open
//! session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::realtime::{
    ConnectionEvent, RealtimeConnection, ReconnectBackoff, RetryPolicy, SessionConfig,
};
use crate::{ConversationState, Error, Result, Voice};

/// Voice swap parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapConfig {
    /// Backoff for reconnecting with the new voice
    pub retry: RetryPolicy,
    /// How long to wait for session-ready before introducing anyway
    pub ready_timeout: Duration,
    /// How long to wait for the introduction turn before resuming capture
    pub introduction_timeout: Duration,
    /// Instruction asking the assistant to introduce its new voice
    pub introduction_prompt: String,
}

impl Default for SwapConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            ready_timeout: Duration::from_secs(10),
            introduction_timeout: Duration::from_secs(15),
            introduction_prompt: "Your voice was just changed. In one short sentence, greet the \
                                  user in your new voice."
                .to_string(),
        }
    }
}

/// Result of a swap request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapOutcome {
    /// Reconnected with the new voice; the introduction is under way
    Swapped,
    /// The new voice could not connect and the previous one was restored
    Reverted {
        /// Voice back in use
        voice: Voice,
    },
    /// No session is active; the voice applies to the next one
    Recorded,
    /// The requested voice is already in use
    Unchanged,
}

/// Sequences disconnect, reconnect and introduction for a voice change
pub struct VoiceSwapCoordinator {
    state: ConversationState,
    connection: Arc<RealtimeConnection>,
    config: SwapConfig,
    in_flight: tokio::sync::Mutex<()>,
    awaiting_introduction: Arc<AtomicBool>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl VoiceSwapCoordinator {
    #[must_use]
    pub fn new(
        state: ConversationState,
        connection: Arc<RealtimeConnection>,
        config: SwapConfig,
    ) -> Self {
        Self {
            state,
            connection,
            config,
            in_flight: tokio::sync::Mutex::new(()),
            awaiting_introduction: Arc::new(AtomicBool::new(false)),
            watcher: Mutex::new(None),
        }
    }

    /// Whether the new voice's introduction has been requested but not finished
    #[must_use]
    pub fn awaiting_introduction(&self) -> bool {
        self.awaiting_introduction.load(Ordering::SeqCst)
    }

    /// Switch the active session to `voice`
    ///
    /// `session` is the base configuration; only its voice is replaced. The
    /// swap flag is raised before any network I/O and cleared on every exit
    /// path: after the introduction turn, after a fallback, or on failure.
    ///
    /// # Errors
    ///
    /// `SwapInProgress` if another swap has not finished, `VoiceSwapFailed` if
    /// neither the new nor the previous voice could reconnect or the session
    /// ended meanwhile (the session is deactivated), `FatalProtocol` if the new
    /// session fails fatally
    pub async fn swap_voice(&self, voice: Voice, session: &SessionConfig) -> Result<SwapOutcome> {
        let Ok(_guard) = self.in_flight.try_lock() else {
            return Err(Error::SwapInProgress);
        };
        let snapshot = self.state.snapshot();
        if snapshot.is_voice_swapping {
            return Err(Error::SwapInProgress);
        }
        if !snapshot.active {
            self.state.set_selected_voice(voice);
            return Ok(SwapOutcome::Recorded);
        }
        if snapshot.selected_voice == voice {
            return Ok(SwapOutcome::Unchanged);
        }

        // Gate closes before any reconnect I/O
        self.state.set_voice_swapping(true);
        let prior = snapshot.selected_voice;
        self.state.set_selected_voice(voice);
        tracing::info!(from = %prior, to = %voice, "voice swap started");

        self.connection.disconnect().await;

        let events = match self.reconnect(&session.with_voice(voice)).await {
            Ok(events) => events,
            Err(e) if !self.state.snapshot().active => {
                self.finish();
                return Err(match e {
                    Error::FatalProtocol(_) => e,
                    other => Error::VoiceSwapFailed(format!("session ended during swap: {other}")),
                });
            }
            Err(e) => return self.fall_back(prior, session, e).await,
        };

        self.awaiting_introduction.store(true, Ordering::SeqCst);
        if let Err(e) = self
            .connection
            .send_instruction(&self.config.introduction_prompt)
            .await
        {
            tracing::warn!(error = %e, "failed to request voice introduction");
            self.finish();
            return Ok(SwapOutcome::Swapped);
        }
        self.watch_introduction(events);

        Ok(SwapOutcome::Swapped)
    }

    /// Stop waiting for an introduction
    pub fn cancel(&self) {
        if let Some(watcher) = self.watcher.lock().ok().and_then(|mut w| w.take()) {
            watcher.abort();
        }
        self.finish();
    }

    fn finish(&self) {
        self.awaiting_introduction.store(false, Ordering::SeqCst);
        self.state.set_voice_swapping(false);
    }

    /// Connect with `target` and wait for session-ready
    ///
    /// A channel that closes before session-ready counts as a failed attempt.
    /// Returns the event receiver subscribed before the attempt that succeeded.
    async fn reconnect(
        &self,
        target: &SessionConfig,
    ) -> Result<broadcast::Receiver<ConnectionEvent>> {
        let mut backoff = ReconnectBackoff::new(&self.config.retry);
        let mut attempt = 1;
        loop {
            if !self.state.snapshot().active {
                return Err(Error::NotConnected);
            }
            let mut events = self.connection.subscribe();
            let outcome = match self.connection.connect(target).await {
                Ok(()) => self.wait_ready(&mut events).await,
                Err(e) => Err(e),
            };

            match outcome {
                Ok(true) => return Ok(events),
                Ok(false) => {
                    tracing::warn!(
                        timeout_ms = self.config.ready_timeout.as_millis(),
                        "no session-ready after voice swap, introducing anyway"
                    );
                    return Ok(events);
                }
                Err(e) if e.is_retryable() => {
                    self.connection.disconnect().await;
                    let Some(delay) = backoff.next() else {
                        return Err(e);
                    };
                    tracing::warn!(
                        attempt,
                        delay_ms = delay.as_millis(),
                        error = %e,
                        "voice swap reconnect failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn fall_back(
        &self,
        prior: Voice,
        session: &SessionConfig,
        cause: Error,
    ) -> Result<SwapOutcome> {
        tracing::warn!(error = %cause, voice = %prior, "voice swap failed, restoring previous voice");
        self.state.set_selected_voice(prior);
        let restored = self.connection.connect(&session.with_voice(prior)).await;
        self.finish();

        match restored {
            Ok(()) => Ok(SwapOutcome::Reverted { voice: prior }),
            Err(e) => {
                tracing::error!(error = %e, "could not restore previous voice, ending session");
                self.connection.disconnect().await;
                self.state.deactivate();
                Err(Error::VoiceSwapFailed(format!(
                    "{cause}; restoring {prior} failed: {e}"
                )))
            }
        }
    }

    /// Wait for session-ready; `Ok(false)` on timeout
    async fn wait_ready(&self, events: &mut broadcast::Receiver<ConnectionEvent>) -> Result<bool> {
        let ready = async {
            loop {
                match events.recv().await {
                    Ok(ConnectionEvent::Ready) => return Ok(()),
                    Ok(ConnectionEvent::Fatal(message)) => {
                        return Err(Error::FatalProtocol(message));
                    }
                    Ok(ConnectionEvent::Closed) | Err(RecvError::Closed) => {
                        return Err(Error::ConnectionFailed(
                            "channel closed before session-ready".to_string(),
                        ));
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "voice swap lagged behind connection events");
                    }
                }
            }
        };

        match tokio::time::timeout(self.config.ready_timeout, ready).await {
            Ok(Ok(())) => Ok(true),
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(false),
        }
    }

    fn watch_introduction(&self, mut events: broadcast::Receiver<ConnectionEvent>) {
        let state = self.state.clone();
        let awaiting = Arc::clone(&self.awaiting_introduction);
        let timeout = self.config.introduction_timeout;

        let handle = tokio::spawn(async move {
            let completed = tokio::time::timeout(timeout, async {
                loop {
                    match events.recv().await {
                        Ok(ConnectionEvent::TurnComplete) if awaiting.load(Ordering::SeqCst) => {
                            return true;
                        }
                        Ok(ConnectionEvent::Fatal(_) | ConnectionEvent::Closed)
                        | Err(RecvError::Closed) => return false,
                        Ok(_) | Err(RecvError::Lagged(_)) => {}
                    }
                }
            })
            .await;

            awaiting.store(false, Ordering::SeqCst);
            state.set_voice_swapping(false);
            match completed {
                Ok(true) => tracing::info!("voice introduction complete, capture resumed"),
                Ok(false) => tracing::warn!("connection ended during voice introduction"),
                Err(_) => tracing::warn!(
                    timeout_ms = timeout.as_millis(),
                    "voice introduction timed out, capture resumed"
                ),
            }
        });

        if let Ok(mut watcher) = self.watcher.lock()
            && let Some(previous) = watcher.replace(handle)
        {
            previous.abort();
        }
    }
}
