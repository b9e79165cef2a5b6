//! Invite redemption: turn an invite token into a claimed crew slot.
//!
//! The claim walks a fixed sequence: look up the public invitation, accept
//! the share grant behind it, locate the crew record inside the newly
//! visible shared zone, check whose name is on it, then write the caller's
//! identity into the owner slot with a forced overwrite. Two callers racing
//! on the same unclaimed record both succeed and the last write wins; the
//! owner slot is advisory membership, not an access grant, so the race is
//! accepted rather than fenced.
//!
//! The caller's identity must be resolved before ownership is examined or
//! written; a claim never puts the placeholder identity into the owner
//! slot. Records that already hold the placeholder (written by earlier
//! client builds that stamped a session id alongside) are healed by
//! [`ClaimProtocol::repair_placeholder_claims`].

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::records::{Database, FieldValue, Filter, Record, ZoneRef};
use crate::session::{SessionStore, PENDING_IDENTITY};
use crate::sync::RecordSyncClient;
use crate::tours::TourCatalog;

pub const INVITATION_TYPE: &str = "TourInvite";
pub const MEMBER_TYPE: &str = "CrewMember";
/// Field on the crew record holding the claimer's identity.
pub const OWNER_FIELD: &str = "userRecordName";
pub const INVITE_TOKEN_FIELD: &str = "inviteToken";
/// Session stamp earlier client builds wrote alongside placeholder claims.
/// Read by the repair pass, never written by a new claim.
const CLAIM_SESSION_FIELD: &str = "claimedSessionID";

/// Zone grants propagate slowly after a share is accepted; the locate loop
/// rides that out.
const LOCATE_ATTEMPTS: u32 = 5;
const LOCATE_RETRY_DELAY: Duration = Duration::from_secs(2);
const GRANT_PROPAGATION_DELAY: Duration = Duration::from_secs(2);
const IDENTITY_POLL_INTERVAL: Duration = Duration::from_millis(500);
const IDENTITY_POLL_LIMIT: u32 = 10;

/// Terminal claim failures, each phrased for direct display.
#[derive(Debug, Error)]
pub enum ClaimError {
    #[error("This invite link is invalid or has expired.")]
    InvitationNotFound,
    #[error(
        "The crew member record for this invite could not be found. \
         Make sure the tour owner has shared the tour with you first, then try again."
    )]
    ResourceNotFound,
    #[error("This invite has already been claimed by another user.")]
    AlreadyClaimedByOther,
    #[error(
        "We couldn't confirm your account yet. \
         Please try the invite link again in a moment."
    )]
    IdentityUnresolved,
    #[error("Your session has expired. Please sign in again.")]
    SessionExpired,
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for ClaimError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::SessionExpired => ClaimError::SessionExpired,
            other => ClaimError::Store(other),
        }
    }
}

/// Progress through the claim, reported to the caller's UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimPhase {
    LookingUpInvitation,
    AcceptingShare,
    LocatingResource,
    CheckingOwnership,
    Claiming,
    Done,
}

/// Public invitation record, read-only.
#[derive(Debug, Clone)]
pub struct Invitation {
    pub token: String,
    pub tour_name: Option<String>,
    pub role_name: Option<String>,
    pub share_url: Option<String>,
    pub resource_record_name: Option<String>,
}

impl Invitation {
    fn from_record(token: &str, record: &Record) -> Self {
        let text = |name: &str| record.text_field(name).map(str::to_string);
        Self {
            token: token.to_string(),
            tour_name: text("tourName"),
            role_name: text("roleName"),
            share_url: text("shareURL"),
            resource_record_name: text("crewMemberRecordName"),
        }
    }
}

/// Successful claim. `already_member` marks the idempotent path where the
/// caller's name was already on the record.
#[derive(Debug, Clone)]
pub struct ClaimOutcome {
    pub tour_name: String,
    pub role_name: String,
    pub already_member: bool,
}

impl ClaimOutcome {
    pub fn message(&self) -> String {
        if self.already_member {
            format!("You're already in {}", self.tour_name)
        } else {
            format!("Joined {} as {}", self.tour_name, self.role_name)
        }
    }
}

pub struct ClaimProtocol {
    sync: Arc<RecordSyncClient>,
    session: SessionStore,
    tours: TourCatalog,
}

impl ClaimProtocol {
    pub fn new(sync: Arc<RecordSyncClient>, session: SessionStore, tours: TourCatalog) -> Self {
        Self { sync, session, tours }
    }

    /// Redeem an invite token end to end.
    pub async fn redeem(&self, token: &str) -> Result<ClaimOutcome, ClaimError> {
        self.redeem_with_progress(token, |_| {}).await
    }

    pub async fn redeem_with_progress(
        &self,
        token: &str,
        progress: impl Fn(ClaimPhase),
    ) -> Result<ClaimOutcome, ClaimError> {
        if self.session.credential().is_none() {
            return Err(ClaimError::SessionExpired);
        }
        // Start identity resolution early; the claim step waits on it.
        if self.session.is_pending() {
            let session = self.session.clone();
            tokio::spawn(async move {
                session.resolve_identity_now().await;
            });
        }

        progress(ClaimPhase::LookingUpInvitation);
        let invitation = self
            .lookup_invitation(token)
            .await?
            .ok_or(ClaimError::InvitationNotFound)?;
        let tour_name = invitation
            .tour_name
            .clone()
            .unwrap_or_else(|| "this tour".to_string());
        let role_name = invitation
            .role_name
            .clone()
            .unwrap_or_else(|| "Crew".to_string());
        info!(token, tour = %tour_name, "invitation found");

        progress(ClaimPhase::AcceptingShare);
        if let Some(share_url) = &invitation.share_url {
            self.accept_share(share_url).await;
        }

        progress(ClaimPhase::LocatingResource);
        let member = self
            .locate_member(token, invitation.resource_record_name.as_deref())
            .await?
            .ok_or(ClaimError::ResourceNotFound)?;

        progress(ClaimPhase::CheckingOwnership);
        // Ownership is only examined with a real identity in hand; claiming
        // with the placeholder would poison the owner slot.
        let identity = self
            .wait_for_identity()
            .await
            .ok_or(ClaimError::IdentityUnresolved)?;
        let current_owner = member
            .text_field(OWNER_FIELD)
            .filter(|owner| !owner.is_empty() && *owner != PENDING_IDENTITY);
        if let Some(owner) = current_owner {
            if owner == identity {
                debug!(record = %member.record_name, "already claimed by this caller");
                self.refresh_tours().await;
                progress(ClaimPhase::Done);
                return Ok(ClaimOutcome { tour_name, role_name, already_member: true });
            }
            return Err(ClaimError::AlreadyClaimedByOther);
        }

        progress(ClaimPhase::Claiming);
        self.write_claim(&member, &identity).await?;
        info!(record = %member.record_name, tour = %tour_name, "crew slot claimed");

        self.refresh_tours().await;
        progress(ClaimPhase::Done);
        Ok(ClaimOutcome { tour_name, role_name, already_member: false })
    }

    /// Repair claims written with the placeholder identity by an earlier
    /// run of this same session, now that the real identity is known.
    pub async fn repair_placeholder_claims(&self) -> Result<usize, ClaimError> {
        let Some(identity) = self.session.identity() else {
            return Ok(0);
        };
        let Some(session_id) = self.session.session_id() else {
            return Ok(0);
        };

        let mut repaired = 0;
        for zone in self.tours.list_shared_zones().await? {
            let orphans = self
                .sync
                .query(
                    Database::Shared,
                    &zone,
                    MEMBER_TYPE,
                    &[Filter::text(OWNER_FIELD, PENDING_IDENTITY)],
                    &[],
                )
                .await?;
            for orphan in orphans {
                if orphan.text_field(CLAIM_SESSION_FIELD) != Some(session_id.as_str()) {
                    continue;
                }
                let mut fixed = orphan;
                fixed.set_field(OWNER_FIELD, FieldValue::Text(identity.0.clone()));
                fixed.set_field(
                    "updatedAt",
                    FieldValue::Timestamp(chrono::Utc::now().timestamp_millis()),
                );
                self.sync.force_save(Database::Shared, &fixed).await?;
                info!(record = %fixed.record_name, "repaired placeholder claim");
                repaired += 1;
            }
        }
        Ok(repaired)
    }

    async fn lookup_invitation(&self, token: &str) -> Result<Option<Invitation>, ClaimError> {
        let zone = ZoneRef::default_zone();
        let records = self
            .sync
            .query(
                Database::Public,
                &zone,
                INVITATION_TYPE,
                &[Filter::text(INVITE_TOKEN_FIELD, token)],
                &[],
            )
            .await?;
        Ok(records
            .first()
            .map(|record| Invitation::from_record(token, record)))
    }

    /// Accept the share grant behind the invitation. Failure here is
    /// tolerated: the caller may already hold access, or the share may be
    /// publicly writable. Either way the grant needs a moment to propagate
    /// before the shared zone becomes visible.
    async fn accept_share(&self, share_url: &str) {
        let Some(short_guid) = short_guid_from_share_url(share_url) else {
            warn!(share_url, "share URL carries no short GUID, skipping acceptance");
            return;
        };

        let body = json!({ "shortGUIDs": [{ "value": short_guid }] });
        match self
            .sync
            .transport()
            .send(Database::Public, "records/accept", body)
            .await
        {
            Ok(_) => {
                debug!(short_guid, "share accepted");
                tokio::time::sleep(GRANT_PROPAGATION_DELAY).await;
            }
            Err(e) => {
                warn!(short_guid, "share acceptance failed, continuing: {}", e);
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        }
    }

    /// Find the crew record across all visible shared zones: direct lookup
    /// by name first, then a token query. Bounded retries cover the window
    /// where the zone grant has not propagated yet.
    async fn locate_member(
        &self,
        token: &str,
        record_name: Option<&str>,
    ) -> Result<Option<Record>, ClaimError> {
        for attempt in 1..=LOCATE_ATTEMPTS {
            if attempt > 1 {
                debug!(attempt, max = LOCATE_ATTEMPTS, "retrying shared zone search");
                tokio::time::sleep(LOCATE_RETRY_DELAY).await;
            }

            let zones = match self.tours.list_shared_zones().await {
                Ok(zones) => zones,
                Err(StoreError::SessionExpired) => return Err(ClaimError::SessionExpired),
                Err(e) => {
                    warn!(attempt, "failed to list shared zones: {}", e);
                    continue;
                }
            };
            if zones.is_empty() {
                debug!(attempt, "no shared zones visible yet");
                continue;
            }

            for zone in &zones {
                if let Some(name) = record_name {
                    match self.sync.lookup(Database::Shared, zone, name).await {
                        Ok(Some(record)) => return Ok(Some(record)),
                        Ok(None) => {}
                        Err(StoreError::SessionExpired) => {
                            return Err(ClaimError::SessionExpired)
                        }
                        Err(e) => warn!(zone = %zone, "direct lookup failed: {}", e),
                    }
                }

                match self
                    .sync
                    .query(
                        Database::Shared,
                        zone,
                        MEMBER_TYPE,
                        &[Filter::text(INVITE_TOKEN_FIELD, token)],
                        &[],
                    )
                    .await
                {
                    Ok(records) if !records.is_empty() => {
                        return Ok(records.into_iter().next())
                    }
                    Ok(_) => {}
                    Err(StoreError::SessionExpired) => return Err(ClaimError::SessionExpired),
                    Err(e) => warn!(zone = %zone, "token query failed: {}", e),
                }
            }
        }

        warn!(token, "crew record not found after all retries");
        Ok(None)
    }

    /// Give identity resolution a bounded window to finish. Accounts with
    /// no private zone 400 on the confirmation endpoint and may never
    /// resolve here; that surfaces as [`ClaimError::IdentityUnresolved`].
    async fn wait_for_identity(&self) -> Option<String> {
        if let Some(identity) = self.session.identity() {
            return Some(identity.0);
        }
        self.session.resolve_identity_now().await;

        for _ in 0..IDENTITY_POLL_LIMIT {
            if let Some(identity) = self.session.identity() {
                return Some(identity.0);
            }
            tokio::time::sleep(IDENTITY_POLL_INTERVAL).await;
        }
        debug!("identity still pending after bounded wait");
        None
    }

    /// Write the caller's name into the owner slot. Forced overwrite:
    /// invite claims are the one path allowed to ignore the change-tag
    /// race, since both racers write equivalent membership.
    async fn write_claim(&self, member: &Record, identity: &str) -> Result<(), ClaimError> {
        let now = chrono::Utc::now().timestamp_millis();
        let mut claimed = member.clone();
        claimed.set_field(OWNER_FIELD, FieldValue::Text(identity.to_string()));
        claimed.set_field("claimedAt", FieldValue::Timestamp(now));
        claimed.set_field("updatedAt", FieldValue::Timestamp(now));

        self.sync.force_save(Database::Shared, &claimed).await?;
        Ok(())
    }

    async fn refresh_tours(&self) {
        self.tours.fetch_tours().await;
    }
}

/// Pull the short GUID out of a share URL: the last path segment, e.g.
/// `https://www.icloud.com/share/0abCDeFgHiJ#TourCalZone` -> `0abCDeFgHiJ`.
fn short_guid_from_share_url(share_url: &str) -> Option<String> {
    let without_fragment = share_url.split(['#', '?']).next()?;
    let rest = without_fragment
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(without_fragment);
    let mut segments = rest.split('/').filter(|s| !s.is_empty());
    let _host = segments.next()?;
    segments.last().map(str::to_string)
}
