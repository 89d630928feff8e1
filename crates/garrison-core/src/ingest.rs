//! Batch ingestion of group message events.
//!
//! The pipeline decrypts a batch of kind-445 events, classifies the MLS
//! messages inside, applies commits in a deterministic total order under
//! the admin policy, stores proposals, and collects application rumors.
//! A single bad event never fails the batch: everything that cannot be
//! read or applied lands in the unreadable bucket of the result.
//!
//! Commit order is (created_at ascending, publisher key ascending, event
//! id ascending). The publisher key is ephemeral, which is exactly why it
//! works as a tiebreak: no sender can bias their position without
//! grinding keys against every other unseen commit in the batch.

use std::collections::VecDeque;

use openmls::prelude::tls_codec::Deserialize as TlsDeserialize;
use openmls::prelude::*;

use garrison_proto::{Event, EventId, Rumor};

use crate::admin::{check_commit_sender, CommitVerdict};
use crate::config::Config;
use crate::envelope::open_group_payload;
use crate::error::{Error, Result};
use crate::group::GroupState;

/// Bounded memory of recently published event ids.
///
/// A facade feeds its own kind-445 events through this set so ingest does
/// not push them back into OpenMLS, which refuses to process its own
/// commits.
pub struct RecentIds {
    ring: VecDeque<EventId>,
    capacity: usize,
}

impl RecentIds {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn insert(&mut self, id: EventId) {
        if self.ring.contains(&id) {
            return;
        }
        if self.ring.len() == self.capacity {
            self.ring.pop_front();
        }
        self.ring.push_back(id);
    }

    pub fn contains(&self, id: &EventId) -> bool {
        self.ring.contains(id)
    }
}

impl Default for RecentIds {
    fn default() -> Self {
        Self::new(128)
    }
}

/// Result of ingesting one batch.
#[derive(Debug, Default)]
pub struct IngestOutcome {
    /// Commits applied, in application order.
    pub applied_commits: Vec<EventId>,
    /// Commits rejected by policy, with the reason.
    pub rejected_commits: Vec<(EventId, String)>,
    /// Decoded application rumors, in processing order.
    pub application_rumors: Vec<Rumor>,
    /// Events that could not be decrypted, decoded or applied.
    pub unreadable: Vec<Event>,
    /// Events skipped because this facade published them.
    pub skipped_own: usize,
}

impl IngestOutcome {
    /// True when at least one commit advanced the state.
    pub fn state_changed(&self) -> bool {
        !self.applied_commits.is_empty()
    }
}

/// A decrypted event awaiting processing.
struct PendingMessage {
    event: Event,
    mls_bytes: Vec<u8>,
    content_type: ContentType,
}

impl PendingMessage {
    /// Re-parse the protocol message. The TLS bytes are kept so a message
    /// can be fed to OpenMLS again on a later retry pass.
    fn protocol_message(&self) -> Result<ProtocolMessage> {
        let message = MlsMessageIn::tls_deserialize_exact(&self.mls_bytes)
            .map_err(|e| Error::Unreadable(e.to_string()))?;
        message
            .try_into_protocol_message()
            .map_err(|e| Error::Unreadable(e.to_string()))
    }
}

/// Ingest a batch of kind-445 events for one group.
pub fn ingest_batch(
    state: &mut GroupState,
    events: &[Event],
    config: &Config,
    own: &RecentIds,
) -> IngestOutcome {
    let mut outcome = IngestOutcome::default();

    let mut encrypted: Vec<Event> = Vec::new();
    for event in events {
        if own.contains(&event.id) {
            outcome.skipped_own += 1;
        } else {
            encrypted.push(event.clone());
        }
    }

    // Decrypt and apply with bounded retries. An event sealed under an
    // epoch this state has not reached yet stays in the encrypted pool
    // and gets another decrypt attempt after a commit from the same
    // batch advances the epoch; the same goes for a message whose
    // processing depends on a not-yet-applied commit.
    let mut proposals: Vec<PendingMessage> = Vec::new();
    let mut applications: Vec<PendingMessage> = Vec::new();
    let mut commits: Vec<PendingMessage> = Vec::new();
    let max_passes = config.ingest_max_retries.max(1);
    for _pass in 0..max_passes {
        let mut progressed = false;

        let mut still_encrypted = Vec::new();
        for event in encrypted.drain(..) {
            match open_group_payload(state, &event) {
                Ok(mls_bytes) => match classify(event, mls_bytes) {
                    Ok(pending) => {
                        progressed = true;
                        match pending.content_type {
                            ContentType::Commit => commits.push(pending),
                            ContentType::Proposal => proposals.push(pending),
                            _ => applications.push(pending),
                        }
                    }
                    Err((event, e)) => {
                        tracing::debug!(event = %event.id, error = %e, "not an MLS message");
                        outcome.unreadable.push(event);
                        progressed = true;
                    }
                },
                Err(e) => {
                    tracing::debug!(event = %event.id, error = %e, "envelope decrypt failed");
                    still_encrypted.push(event);
                }
            }
        }
        encrypted = still_encrypted;

        sort_commits(&mut commits);

        proposals.retain(|pending| match process_proposal(state, pending) {
            Ok(()) => {
                progressed = true;
                false
            }
            Err(_) => true,
        });

        applications.retain(|pending| match process_application(state, pending) {
            Ok(rumor) => {
                progressed = true;
                outcome.application_rumors.push(rumor);
                false
            }
            Err(ApplicationFailure::Retryable) => true,
            Err(ApplicationFailure::Invalid) => {
                outcome.unreadable.push(pending.event.clone());
                progressed = true;
                false
            }
        });

        let mut remaining = Vec::new();
        for pending in commits.drain(..) {
            match process_commit(state, &pending, config) {
                Ok(CommitVerdict::Apply) => {
                    progressed = true;
                    outcome.applied_commits.push(pending.event.id);
                }
                Ok(CommitVerdict::Reject(reason)) => {
                    progressed = true;
                    tracing::warn!(event = %pending.event.id, %reason, "commit rejected");
                    outcome.rejected_commits.push((pending.event.id, reason));
                }
                Err(e) => {
                    tracing::debug!(event = %pending.event.id, error = %e, "commit deferred");
                    remaining.push(pending);
                }
            }
        }
        commits = remaining;

        let drained = encrypted.is_empty()
            && commits.is_empty()
            && proposals.is_empty()
            && applications.is_empty();
        if drained || !progressed {
            break;
        }
    }

    outcome.unreadable.extend(encrypted);
    for pending in proposals.into_iter().chain(applications).chain(commits) {
        outcome.unreadable.push(pending.event);
    }
    outcome
}

fn classify(event: Event, mls_bytes: Vec<u8>) -> std::result::Result<PendingMessage, (Event, Error)> {
    let protocol_message = MlsMessageIn::tls_deserialize_exact(&mls_bytes)
        .map_err(|e| Error::Unreadable(e.to_string()))
        .and_then(|message| {
            message
                .try_into_protocol_message()
                .map_err(|e| Error::Unreadable(e.to_string()))
        });
    match protocol_message {
        Ok(protocol_message) => Ok(PendingMessage {
            event,
            mls_bytes,
            content_type: protocol_message.content_type(),
        }),
        Err(e) => Err((event, e)),
    }
}

/// Total order over commits: time, then publisher, then id.
fn sort_commits(commits: &mut [PendingMessage]) {
    commits.sort_by(|a, b| {
        a.event
            .created_at
            .cmp(&b.event.created_at)
            .then_with(|| a.event.pubkey.cmp(&b.event.pubkey))
            .then_with(|| a.event.id.cmp(&b.event.id))
    });
}

fn process_proposal(state: &mut GroupState, pending: &PendingMessage) -> Result<()> {
    let protocol_message = pending.protocol_message()?;
    let (group, provider, _signer) = state.mls_parts();
    let processed = group
        .process_message(provider, protocol_message)
        .map_err(|e| Error::ProcessMessage(e.to_string()))?;
    match processed.into_content() {
        ProcessedMessageContent::ProposalMessage(proposal) => {
            let (group, provider, _signer) = state.mls_parts();
            group
                .store_pending_proposal(provider.storage(), *proposal)
                .map_err(|e| Error::Storage(e.to_string()))
        }
        _ => Err(Error::ProcessMessage(
            "classified proposal resolved to another content type".into(),
        )),
    }
}

enum ApplicationFailure {
    /// Might succeed after a commit from the same batch applies.
    Retryable,
    /// Decodes but is not a valid application rumor.
    Invalid,
}

fn process_application(
    state: &mut GroupState,
    pending: &PendingMessage,
) -> std::result::Result<Rumor, ApplicationFailure> {
    let protocol_message = pending
        .protocol_message()
        .map_err(|_| ApplicationFailure::Retryable)?;
    let (group, provider, _signer) = state.mls_parts();
    let processed = group
        .process_message(provider, protocol_message)
        .map_err(|_| ApplicationFailure::Retryable)?;
    match processed.into_content() {
        ProcessedMessageContent::ApplicationMessage(application) => {
            Rumor::deserialize(&application.into_bytes()).map_err(|e| {
                tracing::warn!(error = %e, "application payload is not a rumor");
                ApplicationFailure::Invalid
            })
        }
        _ => Err(ApplicationFailure::Invalid),
    }
}

fn process_commit(
    state: &mut GroupState,
    pending: &PendingMessage,
    config: &Config,
) -> Result<CommitVerdict> {
    let group_data = state.group_data();
    let protocol_message = pending.protocol_message()?;

    let (group, provider, _signer) = state.mls_parts();
    let processed = group
        .process_message(provider, protocol_message)
        .map_err(|e| Error::ProcessMessage(e.to_string()))?;

    // Resolve the sender leaf's signature key from the ratchet tree so
    // the credential policy can rule on the pair.
    let sender_signature_key = match processed.sender() {
        Sender::Member(index) => group
            .members()
            .find(|member| member.index == *index)
            .map(|member| SignaturePublicKey::from(member.signature_key)),
        _ => None,
    };

    let verdict = check_commit_sender(
        group_data.as_ref(),
        processed.credential(),
        sender_signature_key.as_ref(),
        config.on_unverifiable_commit,
    );

    match processed.into_content() {
        ProcessedMessageContent::StagedCommitMessage(staged) => match verdict {
            CommitVerdict::Apply => {
                let (group, provider, _signer) = state.mls_parts();
                group
                    .merge_staged_commit(provider, *staged)
                    .map_err(|e| Error::ProcessMessage(e.to_string()))?;
                // Fails when this commit removed us from the group; the
                // merge itself still counts.
                if let Err(e) = state.refresh_exporter_secret() {
                    tracing::debug!(error = %e, "exporter secret unavailable after merge");
                }
                Ok(CommitVerdict::Apply)
            }
            reject => Ok(reject),
        },
        _ => Err(Error::ProcessMessage(
            "classified commit resolved to another content type".into(),
        )),
    }
}
