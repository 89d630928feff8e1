//! Admin policy for commits.
//!
//! Only leaves whose credential identity appears in the group data's
//! admin list may author commits. The sender's credential is first run
//! through the [`CredentialPolicy`] against the leaf's signature key;
//! OpenMLS has already verified the membership signature by the time
//! this check runs. A sender that cannot be resolved or fails the policy
//! is governed by [`OnUnverifiableCommit`].

use openmls::prelude::{Credential, SignaturePublicKey};

use garrison_proto::GroupData;

use crate::config::OnUnverifiableCommit;
use crate::credential::{credential_identity, CredentialPolicy};

/// Outcome of the admin check for one commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitVerdict {
    Apply,
    Reject(String),
}

fn unverifiable(policy: OnUnverifiableCommit, reason: String) -> CommitVerdict {
    match policy {
        OnUnverifiableCommit::Accept => CommitVerdict::Apply,
        OnUnverifiableCommit::Reject => CommitVerdict::Reject(reason),
    }
}

/// Decide whether a commit from `sender` may be applied.
///
/// `signature_key` is the sender leaf's signature key, when the sender
/// could be resolved in the ratchet tree.
pub fn check_commit_sender(
    group_data: Option<&GroupData>,
    sender: &Credential,
    signature_key: Option<&SignaturePublicKey>,
    policy: OnUnverifiableCommit,
) -> CommitVerdict {
    let Some(signature_key) = signature_key else {
        return unverifiable(policy, "commit sender has no resolvable leaf".into());
    };

    if !CredentialPolicy.validate_credential(sender, signature_key) {
        return unverifiable(policy, "commit sender credential fails policy".into());
    }

    let identity = match credential_identity(sender) {
        Ok(identity) => identity,
        Err(e) => {
            return unverifiable(policy, format!("unverifiable commit sender: {e}"));
        }
    };

    let Some(data) = group_data else {
        // No decodable group data means no admin list to check against.
        return unverifiable(policy, "group data unavailable for admin check".into());
    };

    if data.is_admin(&identity) {
        CommitVerdict::Apply
    } else {
        CommitVerdict::Reject(format!("commit from non-admin {identity}"))
    }
}
