// Token lifecycle manager
// Expiry-aware caching with single-flight refresh

use futures::future::{BoxFuture, FutureExt, Shared};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::AbortHandle;

use super::refresh::TokenSource;
use super::types::Token;
use crate::error::TokenError;

/// Default refresh margin: a token closer than this to expiry is refreshed
pub const DEFAULT_SAFETY_MARGIN_SECS: i64 = 60;

/// Outcome of one refresh round, awaited by every caller of that round
type RefreshRound = Shared<BoxFuture<'static, Result<Token, TokenError>>>;

/// The outstanding fetch and the task running it
struct InFlight {
    id: u64,
    round: RefreshRound,
    task: AbortHandle,
}

#[derive(Default)]
struct TokenState {
    /// Most recent successful exchange
    current: Option<Token>,

    /// Set while a fetch is outstanding; cleared by the fetch itself, or by
    /// whoever observes that its task was cancelled
    in_flight: Option<InFlight>,

    next_round: u64,
}

impl TokenState {
    fn clear_round(&mut self, id: u64) {
        if self.in_flight.as_ref().map(|f| f.id) == Some(id) {
            self.in_flight = None;
        }
    }
}

/// Token cache for one dynamic credential strategy.
///
/// At most one fetch is outstanding at a time. Callers arriving while a fetch
/// is in flight await that fetch and receive its outcome, success or failure.
/// The fetch runs on its own task, so dropping any caller (including the one
/// that started it) never cancels a refresh other callers are waiting on.
pub struct TokenManager {
    source: Arc<dyn TokenSource>,
    state: Arc<Mutex<TokenState>>,
    safety_margin: i64,
}

impl TokenManager {
    pub fn new(source: Arc<dyn TokenSource>) -> Self {
        Self::with_safety_margin(source, DEFAULT_SAFETY_MARGIN_SECS)
    }

    pub fn with_safety_margin(source: Arc<dyn TokenSource>, safety_margin: i64) -> Self {
        Self {
            source,
            state: Arc::new(Mutex::new(TokenState::default())),
            safety_margin,
        }
    }

    pub fn safety_margin(&self) -> i64 {
        self.safety_margin
    }

    /// Get a usable token, fetching one if the cached token is missing or
    /// too close to expiry
    pub async fn get_token(&self) -> Result<Token, TokenError> {
        let round = {
            let mut state = self.state.lock().await;

            if let Some(token) = state
                .current
                .as_ref()
                .filter(|t| t.is_usable(self.safety_margin))
            {
                return Ok(token.clone());
            }

            // A live fetch clears the marker before its task ends, so a
            // finished task still marked here was cancelled (runtime shutdown)
            let cancelled = state
                .in_flight
                .as_ref()
                .filter(|f| f.task.is_finished())
                .map(|f| f.id);
            if let Some(id) = cancelled {
                tracing::warn!(round = id, "Discarding cancelled token refresh");
                state.in_flight = None;
            }

            match state.in_flight.as_ref().map(|f| f.round.clone()) {
                Some(round) => {
                    tracing::debug!("Token refresh already in flight, waiting for its outcome");
                    round
                }
                None => self.start_refresh(&mut *state),
            }
        };

        round.await
    }

    /// Spawn the fetch and mark it in flight. Takes the locked state, so the
    /// task cannot clear `in_flight` before it has been set.
    fn start_refresh(&self, state: &mut TokenState) -> RefreshRound {
        state.next_round += 1;
        let id = state.next_round;
        tracing::debug!(round = id, "Refreshing access token...");

        let source = Arc::clone(&self.source);
        let task_state = Arc::clone(&self.state);

        let handle = tokio::spawn(async move {
            // A panicking source must still clear the marker
            let result = AssertUnwindSafe(source.fetch_token())
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    Err(TokenError::Interrupted("token source panicked".to_string()))
                });

            // Swap the token and clear the marker in one critical section
            let mut state = task_state.lock().await;
            state.clear_round(id);
            match &result {
                Ok(token) => {
                    state.current = Some(token.clone());
                    tracing::debug!(expiration = token.expiration, "Access token refreshed");
                }
                Err(e) => {
                    tracing::error!("Token refresh failed: {}", e);
                }
            }

            result
        });

        let task = handle.abort_handle();
        // Weak: the round is stored inside the state it points back to
        let waiter_state = Arc::downgrade(&self.state);
        let round = async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => {
                    // The task never reached its own cleanup
                    if let Some(state) = waiter_state.upgrade() {
                        state.lock().await.clear_round(id);
                    }
                    Err(TokenError::Interrupted(e.to_string()))
                }
            }
        }
        .boxed()
        .shared();

        state.in_flight = Some(InFlight {
            id,
            round: round.clone(),
            task,
        });
        round
    }

    /// Replace the cached token from outside an exchange
    pub async fn set_token(&self, token: Token) {
        let mut state = self.state.lock().await;
        state.current = Some(token);
    }

    /// Drop `token` from the cache if it is still the cached one.
    ///
    /// Used after the server rejected `token`; a newer token stored by a
    /// concurrent refresh is left alone.
    pub async fn invalidate(&self, token: &Token) {
        let mut state = self.state.lock().await;
        if state.current.as_ref() == Some(token) {
            tracing::debug!("Invalidating rejected access token");
            state.current = None;
        }
    }

    /// The cached token, if it still passes the validity check
    pub async fn cached_token(&self) -> Option<Token> {
        let state = self.state.lock().await;
        state
            .current
            .as_ref()
            .filter(|t| t.is_usable(self.safety_margin))
            .cloned()
    }

    /// True while a fetch is outstanding
    pub async fn is_refreshing(&self) -> bool {
        self.state.lock().await.in_flight.is_some()
    }
}

impl fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenManager")
            .field("safety_margin", &self.safety_margin)
            .finish_non_exhaustive()
    }
}
