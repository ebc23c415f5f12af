use crate::{
    billing::{duration_hours, rental_cost},
    eligibility::check_rental_eligibility,
    error::{Result, UdryError},
    types::{epoch_ms, RentalHistory, RentalLog, RentalSession, Stall, UserProfile},
};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

/// Persistence contract for users, stalls, and rental records
///
/// The production deployment backs this with a hosted document database;
/// [`MemoryStore`] backs it in tests and local tooling. All mutating
/// operations are transactional: they either apply every documented write
/// or none of them.
#[async_trait]
pub trait RentalStore: Send + Sync {
    /// Fetch a user's wallet and rental fields.
    ///
    /// # Errors
    ///
    /// Returns [`UdryError::UserNotFound`] for unknown ids.
    async fn user(&self, user_id: &str) -> Result<UserProfile>;

    /// Fetch a stall record by its device id.
    ///
    /// # Errors
    ///
    /// Returns [`UdryError::StallNotFound`] for unknown ids.
    async fn stall(&self, dvid: &str) -> Result<Stall>;

    /// Record a new active rental after a successful rent unlock.
    ///
    /// Atomically writes the session onto the user, decrements the origin
    /// stall's stock, advances its action slot, and consumes the
    /// free-first-rental flag when the session is free.
    ///
    /// # Errors
    ///
    /// Returns [`UdryError::ActiveRentalExists`] when the user already
    /// holds a rental, or [`UdryError::Ineligible`] when the preconditions
    /// fail.
    async fn start_rental(&self, user_id: &str, session: RentalSession) -> Result<()>;

    /// Append a diagnostic entry to the user's active rental trail.
    ///
    /// A no-op when no rental is active; late log writes after settlement
    /// must not fail the caller.
    ///
    /// # Errors
    ///
    /// Returns [`UdryError::UserNotFound`] for unknown ids.
    async fn log_event(&self, user_id: &str, entry: RentalLog) -> Result<()>;

    /// Settle and close the user's active rental.
    ///
    /// `snapshot` is the caller's view of the session being closed; it must
    /// match the stored active rental, which makes the operation idempotent
    /// under double submission. On success the settled cost is deducted
    /// from the user's balance (which may go negative), the destination
    /// stall is credited one umbrella capped at capacity, its action slot
    /// advances, and exactly one history record is written.
    ///
    /// # Errors
    ///
    /// Returns [`UdryError::NoActiveRental`] when there is nothing to
    /// close, [`UdryError::SessionMismatch`] when `snapshot` does not match
    /// the stored rental, or [`UdryError::InvalidSession`] for malformed
    /// payloads. On any error the rental is left intact and the caller may
    /// retry.
    async fn close_rental(
        &self,
        user_id: &str,
        returned_to_stall_id: &str,
        snapshot: &RentalSession,
    ) -> Result<RentalHistory>;
}

#[derive(Default)]
struct Inner {
    users: HashMap<String, UserProfile>,
    stalls: HashMap<String, Stall>,
    history: Vec<RentalHistory>,
}

/// In-memory [`RentalStore`] with the same transactional semantics as the
/// hosted backend
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a user record
    pub async fn insert_user(&self, user_id: impl Into<String>, profile: UserProfile) {
        self.inner.lock().await.users.insert(user_id.into(), profile);
    }

    /// Seed a stall record, keyed by its `dvid`
    pub async fn insert_stall(&self, stall: Stall) {
        self.inner
            .lock()
            .await
            .stalls
            .insert(stall.dvid.clone(), stall);
    }

    /// All settled rentals, oldest first
    pub async fn history(&self) -> Vec<RentalHistory> {
        self.inner.lock().await.history.clone()
    }

    /// Close the active rental at an explicit settlement instant.
    ///
    /// [`RentalStore::close_rental`] settles at the current wall-clock
    /// time; this entry point exists so billing outcomes can be pinned in
    /// tests and backfill tooling.
    ///
    /// # Errors
    ///
    /// Same contract as [`RentalStore::close_rental`].
    pub async fn close_rental_at(
        &self,
        user_id: &str,
        returned_to_stall_id: &str,
        snapshot: &RentalSession,
        end_ms: i64,
    ) -> Result<RentalHistory> {
        let mut inner = self.inner.lock().await;
        close_in_place(&mut inner, user_id, returned_to_stall_id, snapshot, end_ms)
    }
}

#[async_trait]
impl RentalStore for MemoryStore {
    async fn user(&self, user_id: &str) -> Result<UserProfile> {
        self.inner
            .lock()
            .await
            .users
            .get(user_id)
            .cloned()
            .ok_or_else(|| UdryError::UserNotFound(user_id.to_string()))
    }

    async fn stall(&self, dvid: &str) -> Result<Stall> {
        self.inner
            .lock()
            .await
            .stalls
            .get(dvid)
            .cloned()
            .ok_or_else(|| UdryError::StallNotFound(dvid.to_string()))
    }

    async fn start_rental(&self, user_id: &str, session: RentalSession) -> Result<()> {
        let mut inner = self.inner.lock().await;

        let Some(user) = inner.users.get(user_id) else {
            return Err(UdryError::UserNotFound(user_id.to_string()));
        };
        if user.active_rental.is_some() {
            return Err(UdryError::ActiveRentalExists);
        }
        let Some(stall) = inner.stalls.get(&session.stall_id) else {
            return Err(UdryError::StallNotFound(session.stall_id.clone()));
        };
        check_rental_eligibility(stall, user).map_err(UdryError::Ineligible)?;

        // Both records checked; apply every write together.
        let is_free = session.is_free;
        let stall_id = session.stall_id.clone();
        if let Some(stall) = inner.stalls.get_mut(&stall_id) {
            stall.available_umbrellas = stall.available_umbrellas.saturating_sub(1);
            stall.next_action_slot += 1;
        }
        if let Some(user) = inner.users.get_mut(user_id) {
            if is_free {
                user.has_had_first_free_rental = true;
            }
            user.active_rental = Some(session);
        }

        info!(user = %user_id, stall = %stall_id, free = is_free, "Rental started");
        Ok(())
    }

    async fn log_event(&self, user_id: &str, entry: RentalLog) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let Some(user) = inner.users.get_mut(user_id) else {
            return Err(UdryError::UserNotFound(user_id.to_string()));
        };
        match user.active_rental.as_mut() {
            Some(session) => session.logs.push(entry),
            None => {
                debug!(user = %user_id, "Dropping log entry; no active rental");
            }
        }
        Ok(())
    }

    async fn close_rental(
        &self,
        user_id: &str,
        returned_to_stall_id: &str,
        snapshot: &RentalSession,
    ) -> Result<RentalHistory> {
        let mut inner = self.inner.lock().await;
        close_in_place(
            &mut inner,
            user_id,
            returned_to_stall_id,
            snapshot,
            epoch_ms(),
        )
    }
}

fn close_in_place(
    inner: &mut Inner,
    user_id: &str,
    returned_to_stall_id: &str,
    snapshot: &RentalSession,
    end_ms: i64,
) -> Result<RentalHistory> {
    if snapshot.stall_id.is_empty() {
        return Err(UdryError::InvalidSession(
            "session has no origin stall id".to_string(),
        ));
    }
    if snapshot.start_time <= 0 {
        return Err(UdryError::InvalidSession(
            "session has no valid start time".to_string(),
        ));
    }

    let Some(user) = inner.users.get(user_id) else {
        return Err(UdryError::UserNotFound(user_id.to_string()));
    };
    let Some(active) = user.active_rental.as_ref() else {
        return Err(UdryError::NoActiveRental);
    };
    // Identity of a rental is its start instant plus origin stall. A stale
    // or duplicate close request carries a snapshot that no longer matches
    // and is rejected without touching any record.
    if active.start_time != snapshot.start_time || active.stall_id != snapshot.stall_id {
        return Err(UdryError::SessionMismatch);
    }
    if !inner.stalls.contains_key(returned_to_stall_id) {
        return Err(UdryError::StallNotFound(returned_to_stall_id.to_string()));
    }

    // All preconditions hold; from here every write applies.
    let user = inner
        .users
        .get_mut(user_id)
        .ok_or_else(|| UdryError::UserNotFound(user_id.to_string()))?;
    let session = user
        .active_rental
        .take()
        .ok_or(UdryError::NoActiveRental)?;

    let duration = duration_hours(session.start_time, end_ms);
    let final_cost = rental_cost(session.start_time, end_ms, session.is_free);
    user.balance -= final_cost;

    let stall = inner
        .stalls
        .get_mut(returned_to_stall_id)
        .ok_or_else(|| UdryError::StallNotFound(returned_to_stall_id.to_string()))?;
    stall.available_umbrellas = (stall.available_umbrellas + 1).min(stall.total_umbrellas);
    stall.next_action_slot += 1;
    let returned_to_stall_name = stall.name.clone();

    let record = RentalHistory {
        rental_id: Uuid::new_v4().to_string(),
        user_id: user_id.to_string(),
        stall_id: session.stall_id,
        stall_name: session.stall_name,
        start_time: session.start_time,
        is_free: session.is_free,
        end_time: end_ms,
        duration_hours: duration,
        final_cost,
        returned_to_stall_id: returned_to_stall_id.to_string(),
        returned_to_stall_name,
        logs: session.logs,
    };
    inner.history.push(record.clone());

    info!(
        user = %user_id,
        cost = final_cost,
        hours = duration,
        "Rental settled"
    );
    Ok(record)
}
