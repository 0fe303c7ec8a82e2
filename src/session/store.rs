//! Participant-keyed session arena
//!
//! Holds at most one session per participant plus an index from live
//! oracle requests to their owning participant. The index is keyed by
//! oracle and request id together, since each oracle numbers its requests
//! independently. Every mutation goes through `create_with` or
//! `update_and_then`, which hold the participant's entry for the whole
//! step, so at most one mutation per participant is ever in flight while
//! different participants proceed independently.
//!
//! The store does no I/O. Closures passed in may call collaborators; if a
//! closure fails nothing in the store changes.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::BTreeMap;

use super::state::Session;
use crate::error::{Error, Result};
use crate::oracle::OracleKind;
use crate::protocol::{short_hex, ParticipantId, RequestId};

/// Index key of a live oracle request
pub type RequestKey = (OracleKind, RequestId);

/// What to do with the stored session after a successful step
#[derive(Debug)]
pub enum StoreUpdate {
    Keep,
    Replace(Session),
    Remove,
}

#[derive(Default)]
pub struct SessionStore {
    sessions: DashMap<ParticipantId, Session>,
    requests: DashMap<RequestKey, ParticipantId>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn contains(&self, participant: &ParticipantId) -> bool {
        self.sessions.contains_key(participant)
    }

    pub fn get(&self, participant: &ParticipantId) -> Option<Session> {
        self.sessions.get(participant).map(|s| s.clone())
    }

    /// Owner of a live request, if any
    pub fn participant_for(
        &self,
        oracle: OracleKind,
        request_id: &RequestId,
    ) -> Option<ParticipantId> {
        self.requests.get(&(oracle, *request_id)).map(|p| *p)
    }

    /// Create a session for an idle participant.
    ///
    /// `build` runs only when no session exists. Its request is then
    /// claimed in the index, and `commit` runs last with the entry still
    /// held: the session is stored exactly when `commit` succeeds. A
    /// request id already owned by another participant fails the call
    /// before `commit` runs.
    pub fn create_with<B, C>(&self, participant: ParticipantId, build: B, commit: C) -> Result<Session>
    where
        B: FnOnce() -> Result<Session>,
        C: FnOnce(&Session) -> Result<()>,
    {
        match self.sessions.entry(participant) {
            Entry::Occupied(_) => Err(Error::SessionAlreadyActive(short_hex(&participant))),
            Entry::Vacant(vacant) => {
                let session = build()?;
                if session.participant != participant {
                    return Err(Error::CorruptState(
                        "session built for a different participant".to_string(),
                    ));
                }
                session.check_invariants()?;

                let key = session.outstanding.map(|o| o.key());
                if let Some(key) = key {
                    self.claim(key, participant)?;
                }
                if let Err(e) = commit(&session) {
                    if let Some(key) = key {
                        self.requests.remove_if(&key, |_, owner| *owner == participant);
                    }
                    return Err(e);
                }

                vacant.insert(session.clone());
                Ok(session)
            }
        }
    }

    /// Run one transition step on the participant's session.
    pub fn update<F, R>(&self, participant: &ParticipantId, step: F) -> Result<R>
    where
        F: FnOnce(&Session) -> Result<(StoreUpdate, R)>,
    {
        self.update_and_then(participant, step, |_| {})
    }

    /// Run one transition step, then `after_commit` on its output once the
    /// store has committed and before the entry is released. Anything
    /// `after_commit` publishes is therefore ordered with the participant's
    /// other steps.
    pub fn update_and_then<F, A, R>(
        &self,
        participant: &ParticipantId,
        step: F,
        after_commit: A,
    ) -> Result<R>
    where
        F: FnOnce(&Session) -> Result<(StoreUpdate, R)>,
        A: FnOnce(&mut R),
    {
        match self.sessions.entry(*participant) {
            Entry::Vacant(_) => Err(Error::SessionNotFound(short_hex(participant))),
            Entry::Occupied(mut occupied) => {
                let (update, mut output) = step(occupied.get())?;

                match update {
                    StoreUpdate::Keep => {}
                    StoreUpdate::Replace(next) => {
                        next.check_invariants()?;
                        if next.participant != *participant
                            || next.session_id != occupied.get().session_id
                        {
                            return Err(Error::CorruptState(
                                "replacement belongs to another session".to_string(),
                            ));
                        }

                        let previous = occupied.get().outstanding.map(|o| o.key());
                        let current = next.outstanding.map(|o| o.key());
                        if previous != current {
                            if let Some(key) = current {
                                self.claim(key, *participant)?;
                            }
                            if let Some(key) = previous {
                                self.requests.remove(&key);
                            }
                        }
                        occupied.insert(next);
                    }
                    StoreUpdate::Remove => {
                        if let Some(outstanding) = occupied.get().outstanding {
                            self.requests.remove(&outstanding.key());
                        }
                        // entry is released by the removal itself
                        after_commit(&mut output);
                        occupied.remove();
                        return Ok(output);
                    }
                }

                after_commit(&mut output);
                Ok(output)
            }
        }
    }

    /// Record `participant` as the owner of `key`
    fn claim(&self, key: RequestKey, participant: ParticipantId) -> Result<()> {
        match self.requests.entry(key) {
            Entry::Occupied(owner) if *owner.get() != participant => Err(Error::Oracle(format!(
                "{:?} request {} already belongs to {}",
                key.0,
                key.1,
                short_hex(owner.get())
            ))),
            Entry::Occupied(_) => Ok(()),
            Entry::Vacant(vacant) => {
                vacant.insert(participant);
                Ok(())
            }
        }
    }

    /// Ordered copy of every stored session
    pub fn snapshot(&self) -> BTreeMap<ParticipantId, Session> {
        self.sessions
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }

    /// Canonical byte image of the store (sessions and request index)
    pub fn snapshot_bytes(&self) -> Result<Vec<u8>> {
        let requests: BTreeMap<RequestKey, ParticipantId> = self
            .requests
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect();
        Ok(bincode::serialize(&(self.snapshot(), requests))?)
    }

    /// Check every session and the request index against each other.
    pub fn check_invariants(&self) -> Result<()> {
        let sessions = self.snapshot();

        for (participant, session) in &sessions {
            if &session.participant != participant {
                return Err(Error::CorruptState(format!(
                    "session keyed under {} belongs to {}",
                    short_hex(participant),
                    short_hex(&session.participant)
                )));
            }
            session.check_invariants()?;

            if let Some(outstanding) = session.outstanding {
                let (oracle, id) = outstanding.key();
                if self.participant_for(oracle, &id) != Some(*participant) {
                    return Err(Error::CorruptState(format!(
                        "{:?} request {} missing from index",
                        oracle, id
                    )));
                }
            }
        }

        for entry in self.requests.iter() {
            let (oracle, id) = *entry.key();
            let owner_awaits = sessions
                .get(entry.value())
                .map(|s| s.awaits_from(oracle, &id))
                .unwrap_or(false);
            if !owner_awaits {
                return Err(Error::CorruptState(format!(
                    "index holds dead {:?} request {}",
                    oracle, id
                )));
            }
        }

        Ok(())
    }
}
