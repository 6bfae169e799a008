//! Session lifecycle transitions.
//!
//! ```text
//! pending --accept--> accepted --start--> active <--pause/resume--> active(paused)
//!    |                   |                  |
//!    +--reject/cancel    +--(ttl)           +--stop / time out / funds out--> completed
//!    v                   v                  +--(orphaned)--> expired
//! rejected/cancelled   expired
//! ```
//!
//! Every transition runs under the session lock and persists before its
//! event is published.

use rust_decimal::Decimal;

use talkmeter_core::{
    ensure_positive, EndReason, MeterError, Result, Role, SessionEvent, SessionId, SessionRecord,
    SessionStatus, SessionStatusView, UserId,
};

use crate::driver::DriverState;
use crate::engine::SessionEngine;

fn role_name(role: Role) -> &'static str {
    match role {
        Role::Payer => "payer",
        Role::Provider => "provider",
    }
}

/// Check `actor` takes part in `record`, and in the `required` role if given.
fn authorize(
    record: &SessionRecord,
    actor: &UserId,
    required: Option<Role>,
    action: &str,
) -> Result<Role> {
    let role = record.role_of(actor).ok_or_else(|| MeterError::Unauthorized {
        reason: format!("{actor} is not a participant in session {}", record.id),
    })?;
    match required {
        Some(required) if required != role => Err(MeterError::Unauthorized {
            reason: format!("only the {} may {action} this session", role_name(required)),
        }),
        _ => Ok(role),
    }
}

fn require_status(record: &SessionRecord, expected: SessionStatus, action: &str) -> Result<()> {
    if record.status == expected {
        Ok(())
    } else {
        Err(MeterError::invalid_transition(action, record.status))
    }
}

impl SessionEngine {
    /// Ask `provider` for a session billed to `payer`.
    ///
    /// `rate_per_minute` is the provider's quoted rate; without one the
    /// configured default applies.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if the two users already share an open session
    /// or are the same user, and `InvalidAmount` for a non-positive rate.
    pub async fn request_session(
        &self,
        payer: UserId,
        provider: UserId,
        rate_per_minute: Option<Decimal>,
    ) -> Result<SessionStatusView> {
        let inner = &self.inner;
        if payer == provider {
            return Err(MeterError::InvalidState {
                reason: "cannot request a session with yourself".into(),
            });
        }
        let rate = rate_per_minute.unwrap_or(inner.config.default_rate_per_minute);
        ensure_positive(rate)?;

        let _gate = inner.request_gate.lock().await;
        if let Some(open) = inner.store.find_open_session(&payer, &provider)? {
            return Err(MeterError::InvalidState {
                reason: format!("session {} between these users is still {}", open.id, open.status),
            });
        }

        let record = SessionRecord::request(payer, provider, rate, inner.clock.now());
        inner.persist(&record)?;

        tracing::info!(
            session_id = %record.id,
            payer_id = %payer,
            provider_id = %provider,
            rate_per_minute = %rate,
            "Session requested"
        );
        inner.emit(&record, SessionEvent::RequestCreated { rate_per_minute: rate });
        Ok(record.status_view())
    }

    /// Provider accepts a pending request.
    ///
    /// The payer's current balance is captured to size the allotment; it is
    /// captured again when the session starts.
    ///
    /// # Errors
    ///
    /// Returns `Unauthorized` unless `actor` is the provider and
    /// `InvalidState` unless the session is pending.
    pub async fn accept(&self, session_id: SessionId, actor: UserId) -> Result<SessionStatusView> {
        let inner = &self.inner;
        let (_guard, mut record) = inner.lock_and_load(session_id).await?;
        authorize(&record, &actor, Some(Role::Provider), "accept")?;
        require_status(&record, SessionStatus::Pending, "accept")?;

        let balance = inner
            .store
            .get_ledger(&record.payer_id)?
            .map_or(Decimal::ZERO, |ledger| ledger.balance);
        record.snapshot_balance(balance);
        record.status = SessionStatus::Accepted;
        record.updated_at = inner.clock.now();
        inner.persist(&record)?;

        tracing::info!(session_id = %session_id, allotted_seconds = record.allotted_seconds, "Session accepted");
        inner.emit(
            &record,
            SessionEvent::RequestAccepted {
                allotted_seconds: record.allotted_seconds,
            },
        );
        Ok(record.status_view())
    }

    /// Provider declines a pending request.
    ///
    /// # Errors
    ///
    /// Returns `Unauthorized` unless `actor` is the provider and
    /// `InvalidState` unless the session is pending.
    pub async fn reject(&self, session_id: SessionId, actor: UserId) -> Result<SessionStatusView> {
        self.close_request(
            session_id,
            actor,
            Role::Provider,
            "reject",
            SessionStatus::Rejected,
            SessionEvent::RequestRejected,
        )
        .await
    }

    /// Payer withdraws a pending request.
    ///
    /// # Errors
    ///
    /// Returns `Unauthorized` unless `actor` is the payer and
    /// `InvalidState` unless the session is pending.
    pub async fn cancel(&self, session_id: SessionId, actor: UserId) -> Result<SessionStatusView> {
        self.close_request(
            session_id,
            actor,
            Role::Payer,
            "cancel",
            SessionStatus::Cancelled,
            SessionEvent::RequestCancelled,
        )
        .await
    }

    async fn close_request(
        &self,
        session_id: SessionId,
        actor: UserId,
        role: Role,
        action: &str,
        status: SessionStatus,
        event: SessionEvent,
    ) -> Result<SessionStatusView> {
        let inner = &self.inner;
        let (guard, mut record) = inner.lock_and_load(session_id).await?;
        authorize(&record, &actor, Some(role), action)?;
        require_status(&record, SessionStatus::Pending, action)?;

        let now = inner.clock.now();
        record.status = status;
        record.ended_at = Some(now);
        record.updated_at = now;
        inner.persist(&record)?;

        tracing::info!(session_id = %session_id, status = %status, "Session request closed");
        inner.emit(&record, event);
        drop(guard);
        inner.locks.prune(&session_id);
        Ok(record.status_view())
    }

    /// Payer starts an accepted session and metering begins.
    ///
    /// The balance is captured afresh: the allotment reflects funds at the
    /// moment metering starts, not at acceptance.
    ///
    /// # Errors
    ///
    /// Returns `Unauthorized` unless `actor` is the payer, `InvalidState`
    /// unless the session is accepted, `NotFound` if the payer has no ledger
    /// and `InsufficientFunds` if the balance cannot pay for one minute.
    pub async fn start(&self, session_id: SessionId, actor: UserId) -> Result<SessionStatusView> {
        let inner = &self.inner;
        let (_guard, mut record) = inner.lock_and_load(session_id).await?;
        authorize(&record, &actor, Some(Role::Payer), "start")?;
        require_status(&record, SessionStatus::Accepted, "start")?;

        let ledger = inner.ledger.get(&record.payer_id)?;
        if !ledger.covers(record.rate_per_minute) {
            return Err(MeterError::InsufficientFunds {
                balance: ledger.balance,
                required: record.rate_per_minute,
            });
        }

        record.snapshot_balance(ledger.balance);
        record.begin(inner.clock.now());
        inner.persist(&record)?;
        self.spawn_driver(session_id);

        tracing::info!(
            session_id = %session_id,
            allotted_seconds = record.allotted_seconds,
            initial_balance = %record.initial_balance,
            "Session started"
        );
        inner.emit(
            &record,
            SessionEvent::SessionStarted {
                allotted_seconds: record.allotted_seconds,
                initial_balance: record.initial_balance,
            },
        );
        if record.remaining_seconds <= inner.config.low_balance_warning_seconds {
            inner.emit(
                &record,
                SessionEvent::BalanceLow {
                    remaining_seconds: record.remaining_seconds,
                    remaining_balance: record.remaining_balance,
                },
            );
        }
        Ok(record.status_view())
    }

    /// Suspend metering. Time up to now is settled; paused time is free.
    ///
    /// If settling finds the session out of time or funds it is closed
    /// instead, and the closed view returned.
    ///
    /// # Errors
    ///
    /// Returns `Unauthorized` for non-participants and `InvalidState` unless
    /// the session is active and running.
    pub async fn pause(&self, session_id: SessionId, actor: UserId) -> Result<SessionStatusView> {
        let inner = &self.inner;
        let (_guard, mut record) = inner.lock_and_load(session_id).await?;
        authorize(&record, &actor, None, "pause")?;
        if !record.is_metering() {
            return Err(if record.live.is_paused {
                MeterError::InvalidState {
                    reason: "session is already paused".into(),
                }
            } else {
                MeterError::invalid_transition("pause", record.status)
            });
        }

        inner.registry.cancel(&session_id);
        if let Some(reason) = inner.settle(&mut record, &mut DriverState::default()).await {
            self.close_or_resume_driving(&mut record, reason).await?;
            return Ok(record.status_view());
        }

        record.pause(inner.clock.now());
        inner.persist(&record)?;

        tracing::info!(session_id = %session_id, remaining_seconds = record.remaining_seconds, "Session paused");
        inner.emit(
            &record,
            SessionEvent::SessionPaused {
                remaining_seconds: record.remaining_seconds,
            },
        );
        Ok(record.status_view())
    }

    /// Resume a paused session.
    ///
    /// # Errors
    ///
    /// Returns `Unauthorized` for non-participants and `InvalidState` unless
    /// the session is active and paused.
    pub async fn resume(&self, session_id: SessionId, actor: UserId) -> Result<SessionStatusView> {
        let inner = &self.inner;
        let (_guard, mut record) = inner.lock_and_load(session_id).await?;
        authorize(&record, &actor, None, "resume")?;
        require_status(&record, SessionStatus::Active, "resume")?;
        if !record.live.is_paused {
            return Err(MeterError::InvalidState {
                reason: "session is not paused".into(),
            });
        }

        record.resume(inner.clock.now());
        inner.persist(&record)?;
        self.spawn_driver(session_id);

        tracing::info!(session_id = %session_id, remaining_seconds = record.remaining_seconds, "Session resumed");
        inner.emit(
            &record,
            SessionEvent::SessionResumed {
                remaining_seconds: record.remaining_seconds,
            },
        );
        Ok(record.status_view())
    }

    /// End an active session, paused or not.
    ///
    /// Time up to now is settled and the unbilled remainder captured as a
    /// closing debit, pro-rated to the second.
    ///
    /// # Errors
    ///
    /// Returns `Unauthorized` for non-participants, `InvalidState` unless
    /// the session is active and `Locked` if the closing debit could not get
    /// the ledger; the session then stays active.
    pub async fn stop(&self, session_id: SessionId, actor: UserId) -> Result<SessionStatusView> {
        let inner = &self.inner;
        let (guard, mut record) = inner.lock_and_load(session_id).await?;
        authorize(&record, &actor, None, "stop")?;
        require_status(&record, SessionStatus::Active, "stop")?;

        inner.registry.cancel(&session_id);
        let reason = if record.live.is_paused {
            EndReason::Manual
        } else {
            inner
                .settle(&mut record, &mut DriverState::default())
                .await
                .unwrap_or(EndReason::Manual)
        };
        self.close_or_resume_driving(&mut record, reason).await?;

        drop(guard);
        inner.locks.prune(&session_id);
        Ok(record.status_view())
    }

    /// Close `record` for `reason`. If closing fails the settled record is
    /// persisted and, when still running, handed back to a driver.
    pub(crate) async fn close_or_resume_driving(
        &self,
        record: &mut SessionRecord,
        reason: EndReason,
    ) -> Result<()> {
        let inner = &self.inner;
        if let Err(e) = inner
            .finalize(record, SessionStatus::Completed, reason)
            .await
        {
            inner.persist(record)?;
            if record.is_metering() {
                self.spawn_driver(record.id);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Remaining time and balance of a session.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown session and `Unauthorized` for
    /// non-participants.
    pub fn status(&self, session_id: SessionId, actor: UserId) -> Result<SessionStatusView> {
        let record = self.inner.load(&session_id)?;
        authorize(&record, &actor, None, "view")?;
        Ok(record.status_view())
    }

    /// Full session record, including the deduction history.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown session and `Unauthorized` for
    /// non-participants.
    pub fn session(&self, session_id: SessionId, actor: UserId) -> Result<SessionRecord> {
        let record = self.inner.load(&session_id)?;
        authorize(&record, &actor, None, "view")?;
        Ok(record)
    }

    /// Every session `user` takes part in, newest first.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the listing fails.
    pub fn list_sessions(&self, user: UserId) -> Result<Vec<SessionStatusView>> {
        Ok(self
            .inner
            .store
            .list_sessions_for_user(&user)?
            .iter()
            .map(SessionRecord::status_view)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    #[test]
    fn outsiders_are_refused() {
        let record = SessionRecord::request(UserId::generate(), UserId::generate(), dec!(1), Utc::now());
        let result = authorize(&record, &UserId::generate(), None, "view");
        assert!(matches!(result, Err(MeterError::Unauthorized { .. })));
    }

    #[test]
    fn wrong_role_is_refused() {
        let record = SessionRecord::request(UserId::generate(), UserId::generate(), dec!(1), Utc::now());
        let result = authorize(&record, &record.payer_id, Some(Role::Provider), "accept");
        let Err(MeterError::Unauthorized { reason }) = result else {
            panic!("expected unauthorized");
        };
        assert!(reason.contains("provider"));

        assert_eq!(
            authorize(&record, &record.provider_id, Some(Role::Provider), "accept").unwrap(),
            Role::Provider
        );
    }

    #[test]
    fn status_mismatch_names_the_action() {
        let record = SessionRecord::request(UserId::generate(), UserId::generate(), dec!(1), Utc::now());
        let Err(MeterError::InvalidState { reason }) =
            require_status(&record, SessionStatus::Accepted, "start")
        else {
            panic!("expected invalid state");
        };
        assert_eq!(reason, "cannot start a session that is pending");
    }
}
