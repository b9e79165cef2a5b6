//! Authenticated transport to the remote record store.
//!
//! All retry policy lives here; higher layers never re-implement it.
//!
//! - The store intermittently answers 421 for requests it could actually
//!   serve. Those are retried with doubling backoff up to a fixed bound,
//!   then fail with [`StoreError::TransientTransport`] for this call only.
//! - A 401 is authoritative: the session is invalidated synchronously and
//!   the call fails with [`StoreError::SessionExpired`]. Callers never
//!   retry this class.
//! - Every other non-2xx response goes back to the caller untouched.
//!
//! Side effect: the first successful call made while the session is still
//! `Pending` kicks off a one-shot background identity confirmation, which
//! is how `Pending -> SignedIn` happens opportunistically once we know the
//! credential actually works.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::http::{HttpExec, ReqwestExec};
use crate::records::Database;
use crate::session::{Identity, IdentityConfirmer, SessionStore, Token, PENDING_IDENTITY};

/// Status the store returns when it misroutes a request. Transient.
const MISROUTED_STATUS: u16 = 421;
/// Authoritative "this credential is no good" status.
const UNAUTHENTICATED_STATUS: u16 = 401;

/// Bound on attempts for the misroute class. Never exceeded.
const MAX_ATTEMPTS: u32 = 5;
const INITIAL_BACKOFF: Duration = Duration::from_millis(200);
const MAX_BACKOFF: Duration = Duration::from_secs(2);

/// Issues authenticated calls against the record store.
pub struct TransportClient {
    config: StoreConfig,
    session: SessionStore,
    http: Arc<dyn HttpExec>,
}

impl TransportClient {
    /// Build the production transport and register it as the session's
    /// identity confirmer.
    pub fn new(config: StoreConfig, session: SessionStore) -> Result<Arc<Self>, StoreError> {
        let http = Arc::new(ReqwestExec::new(config.request_timeout)?);
        Ok(Self::with_exec(config, session, http))
    }

    /// Build with an explicit executor (tests script one).
    pub fn with_exec(
        config: StoreConfig,
        session: SessionStore,
        http: Arc<dyn HttpExec>,
    ) -> Arc<Self> {
        let client = Arc::new(Self { config, session, http });
        let confirmer: Arc<dyn IdentityConfirmer> = client.clone();
        let weak: Weak<dyn IdentityConfirmer> = Arc::downgrade(&confirmer);
        client.session.attach_confirmer(weak);
        client
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn session(&self) -> &SessionStore {
        &self.session
    }

    /// POST a JSON body to `{database}/{path}` with the API token and the
    /// current credential attached.
    pub async fn send(
        &self,
        database: Database,
        path: &str,
        body: Value,
    ) -> Result<Value, StoreError> {
        let was_pending = self.session.is_pending();
        let data = self.send_raw(database, path, &body).await?;

        if was_pending && self.session.is_pending() {
            // The credential just worked, so confirm the identity behind it
            // without holding up this caller. Coalesced in the session
            // store, so repeated sends cost nothing extra.
            let session = self.session.clone();
            tokio::spawn(async move {
                session.resolve_identity_now().await;
            });
        }

        Ok(data)
    }

    /// The retry loop itself. Used by `send` and by identity confirmation,
    /// which must not re-trigger the confirmation hook.
    async fn send_raw(
        &self,
        database: Database,
        path: &str,
        body: &Value,
    ) -> Result<Value, StoreError> {
        let url = self.endpoint_url(database, path);
        let mut backoff = INITIAL_BACKOFF;

        for attempt in 1..=MAX_ATTEMPTS {
            let response = self.http.post_json(&url, body).await?;

            match response.status {
                MISROUTED_STATUS => {
                    warn!(attempt, max = MAX_ATTEMPTS, %database, path, "store misrouted the request");
                    if attempt == MAX_ATTEMPTS {
                        break;
                    }
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
                UNAUTHENTICATED_STATUS => {
                    warn!(%database, path, "unauthenticated response, invalidating session");
                    self.session.invalidate();
                    return Err(StoreError::SessionExpired);
                }
                status if response.is_success() => {
                    debug!(%database, path, attempt, "request succeeded");
                    if response.body.trim().is_empty() {
                        return Ok(json!({}));
                    }
                    return serde_json::from_str(&response.body).map_err(|e| {
                        StoreError::Decode(format!("{} ({} bytes, HTTP {})", e, response.body.len(), status))
                    });
                }
                status => {
                    return Err(StoreError::Http {
                        status,
                        message: truncate(&response.body, 300),
                    });
                }
            }
        }

        Err(StoreError::TransientTransport { attempts: MAX_ATTEMPTS })
    }

    fn endpoint_url(&self, database: Database, path: &str) -> String {
        let mut url = format!(
            "{}/database/1/{}/{}/{}/{}?ckAPIToken={}",
            self.config.base_url,
            self.config.container_id,
            self.config.environment,
            database.as_str(),
            path,
            urlencoding::encode(&self.config.api_token),
        );
        if let Some(credential) = self.session.credential() {
            url.push_str("&ckSession=");
            url.push_str(&urlencoding::encode(credential.as_str()));
        }
        url
    }
}

#[async_trait]
impl IdentityConfirmer for TransportClient {
    /// Ask the store who the current credential belongs to.
    ///
    /// Accounts that have never touched this container get a client error
    /// here even when the credential is perfectly valid; that is tolerated
    /// (`Ok(None)`), not treated as invalidation.
    async fn confirm_identity(&self, _credential: &Token) -> Result<Option<Identity>, StoreError> {
        match self.send_raw(Database::Public, "users/caller", &json!({})).await {
            Ok(data) => Ok(data
                .get("userRecordName")
                .and_then(Value::as_str)
                .filter(|name| !name.is_empty() && *name != PENDING_IDENTITY)
                .map(|name| Identity(name.to_string()))),
            Err(StoreError::Http { status: 400, .. }) => {
                debug!("caller endpoint rejected a fresh account, leaving session pending");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &s[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::testing::ScriptedExec;
    use crate::session::SessionState;
    use crate::storage::{keys, KeyValueStore, MemoryStore};

    fn pending_stack(exec: Arc<ScriptedExec>) -> (Arc<TransportClient>, SessionStore) {
        let store = Arc::new(MemoryStore::new());
        store.set(keys::CREDENTIAL, "tok-1");
        let session = SessionStore::new(store);
        session.initialize(None);
        let transport = TransportClient::with_exec(StoreConfig::default(), session.clone(), exec);
        (transport, session)
    }

    async fn signed_in_stack(exec: Arc<ScriptedExec>) -> (Arc<TransportClient>, SessionStore) {
        let (transport, session) = pending_stack(exec.clone());
        // Resolve the identity up front so sends do not schedule background
        // confirmations during the test.
        exec.push_json(200, serde_json::json!({ "userRecordName": "user-1" }));
        session.resolve_identity_now().await;
        (transport, session)
    }

    #[tokio::test(start_paused = true)]
    async fn retries_misroutes_with_doubling_backoff() {
        let exec = Arc::new(ScriptedExec::new());
        let (transport, _session) = signed_in_stack(exec.clone()).await;
        for _ in 0..3 {
            exec.push(421, "");
        }
        exec.push_json(200, serde_json::json!({ "records": [] }));

        let started = tokio::time::Instant::now();
        let data = transport
            .send(Database::Private, "records/query", serde_json::json!({}))
            .await
            .unwrap();

        assert_eq!(data["records"], serde_json::json!([]));
        // 1 confirmation request + 4 attempts
        assert_eq!(exec.request_count(), 5);
        // 200ms + 400ms + 800ms of backoff
        assert_eq!(started.elapsed(), Duration::from_millis(1400));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_bounded_attempts() {
        let exec = Arc::new(ScriptedExec::new());
        let (transport, session) = signed_in_stack(exec.clone()).await;
        for _ in 0..MAX_ATTEMPTS {
            exec.push(421, "");
        }

        let err = transport
            .send(Database::Private, "records/query", serde_json::json!({}))
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::TransientTransport { attempts: 5 }));
        // Exhaustion is fatal for the call, not the session
        assert!(session.is_signed_in());
        assert_eq!(exec.request_count(), 1 + MAX_ATTEMPTS as usize);
    }

    #[tokio::test]
    async fn unauthenticated_invalidates_session() {
        let exec = Arc::new(ScriptedExec::new());
        let (transport, session) = signed_in_stack(exec.clone()).await;
        exec.push(401, "");

        let err = transport
            .send(Database::Private, "records/query", serde_json::json!({}))
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::SessionExpired));
        assert_eq!(session.state(), SessionState::SignedOut);
    }

    #[tokio::test]
    async fn other_statuses_pass_through() {
        let exec = Arc::new(ScriptedExec::new());
        let (transport, _session) = signed_in_stack(exec.clone()).await;
        exec.push(503, "upstream sad");

        let err = transport
            .send(Database::Private, "records/query", serde_json::json!({}))
            .await
            .unwrap_err();

        match err {
            StoreError::Http { status, message } => {
                assert_eq!(status, 503);
                assert_eq!(message, "upstream sad");
            }
            other => panic!("expected Http error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn successful_send_while_pending_confirms_in_background() {
        let exec = Arc::new(ScriptedExec::new());
        exec.push_json(200, serde_json::json!({ "records": [] }));
        exec.push_json(200, serde_json::json!({ "userRecordName": "user-7" }));
        let (transport, session) = pending_stack(exec.clone());

        transport
            .send(Database::Private, "records/query", serde_json::json!({}))
            .await
            .unwrap();

        // Give the spawned confirmation a chance to run
        for _ in 0..50 {
            if session.is_signed_in() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(
            session.identity().map(|i| i.0),
            Some("user-7".to_string())
        );
        let urls: Vec<String> = exec.requests().into_iter().map(|(u, _)| u).collect();
        assert!(urls[1].contains("/public/users/caller"));
    }

    #[tokio::test]
    async fn credential_rides_along_as_query_parameter() {
        let exec = Arc::new(ScriptedExec::new());
        let (transport, _session) = signed_in_stack(exec.clone()).await;

        transport
            .send(Database::Shared, "zones/list", serde_json::json!({}))
            .await
            .unwrap();

        let (url, _) = exec.requests().pop().unwrap();
        assert!(url.contains("/shared/zones/list"));
        assert!(url.contains("ckSession=tok-1"));
    }
}
