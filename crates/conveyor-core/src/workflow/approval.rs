//! Approval gate decisions.
//!
//! A gate opens when its stage is reached and collects decisions until it
//! resolves. It passes once `needed_approvers` distinct deciders approved,
//! and rejects on the first rejection or when its deadline passes. A decider
//! repeating a decision is answered with the gate's current outcome and is
//! never counted twice.

use chrono::{DateTime, Duration, Utc};
use conveyor_types::definition::ApprovalSpec;
use conveyor_types::task::{Approval, ApprovalDecision, ApprovalStatus, Decider, Decision};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApprovalError {
    #[error("approval gate is disabled")]
    Disabled,

    #[error("approval gate is not accepting decisions (status: {0:?})")]
    NotOpen(ApprovalStatus),

    #[error("'{0}' is not an allowed approver")]
    NotAllowed(String),
}

/// Mutable view over a stage's approval state.
pub struct ApprovalGate<'a> {
    approval: &'a mut Approval,
}

impl<'a> ApprovalGate<'a> {
    pub fn new(approval: &'a mut Approval) -> Self {
        Self { approval }
    }

    pub fn status(&self) -> ApprovalStatus {
        self.approval.status
    }

    /// Start collecting decisions. Opening an open or decided gate is a no-op.
    pub fn open(&mut self, now: DateTime<Utc>) {
        if self.approval.status == ApprovalStatus::Waiting {
            self.approval.status = ApprovalStatus::Pending;
            self.approval.started_at = Some(now);
        }
    }

    /// When an undecided gate resolves to `reject`.
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        let started = self.approval.started_at?;
        let minutes = i64::try_from(self.approval.timeout_minutes).ok()?;
        started.checked_add_signed(Duration::try_minutes(minutes)?)
    }

    pub fn approve(
        &mut self,
        decider: &Decider,
        comment: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<ApprovalStatus, ApprovalError> {
        self.decide(decider, Decision::Approve, comment, now)
    }

    pub fn reject(
        &mut self,
        decider: &Decider,
        comment: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<ApprovalStatus, ApprovalError> {
        self.decide(decider, Decision::Reject, comment, now)
    }

    /// Record a decision and return the resulting gate status.
    pub fn decide(
        &mut self,
        decider: &Decider,
        decision: Decision,
        comment: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<ApprovalStatus, ApprovalError> {
        if !self.approval.enabled {
            return Err(ApprovalError::Disabled);
        }
        if self.has_decided(&decider.id) {
            tracing::debug!(decider = decider.id.as_str(), "repeated approval decision ignored");
            return Ok(self.approval.status);
        }
        if self.approval.status != ApprovalStatus::Pending {
            return Err(ApprovalError::NotOpen(self.approval.status));
        }
        if !self.approval.approvers.is_empty() && !self.approval.approvers.contains(&decider.id) {
            return Err(ApprovalError::NotAllowed(decider.id.clone()));
        }

        self.approval.decisions.push(ApprovalDecision {
            decider: decider.clone(),
            decision,
            comment: comment.clone(),
            decided_at: now,
        });

        match decision {
            Decision::Reject => {
                let reason = match comment.filter(|c| !c.trim().is_empty()) {
                    Some(comment) => format!("rejected by {}: {comment}", decider.name),
                    None => format!("rejected by {}", decider.name),
                };
                self.resolve(ApprovalStatus::Reject, Some(reason), now);
            }
            Decision::Approve => {
                if self.approvals() >= self.approval.needed_approvers as usize {
                    self.resolve(ApprovalStatus::Passed, None, now);
                }
            }
        }

        Ok(self.approval.status)
    }

    /// Reject the gate if its deadline has passed. Returns whether it expired.
    pub fn expire(&mut self, now: DateTime<Utc>) -> bool {
        if self.approval.status != ApprovalStatus::Pending {
            return false;
        }
        match self.deadline() {
            Some(deadline) if now >= deadline => {
                let reason = format!(
                    "approval timed out after {} minutes",
                    self.approval.timeout_minutes
                );
                self.resolve(ApprovalStatus::Reject, Some(reason), now);
                true
            }
            _ => false,
        }
    }

    /// Close an undecided gate because the task was cancelled.
    pub fn cancel(&mut self, now: DateTime<Utc>) {
        if !self.approval.status.is_decided() {
            self.resolve(ApprovalStatus::Cancelled, None, now);
        }
    }

    /// Discard all decisions and restore the configured gate.
    pub fn reset(&mut self, spec: &ApprovalSpec) {
        *self.approval = Approval::from(spec);
    }

    fn has_decided(&self, decider_id: &str) -> bool {
        self.approval
            .decisions
            .iter()
            .any(|d| d.decider.id == decider_id)
    }

    fn approvals(&self) -> usize {
        self.approval
            .decisions
            .iter()
            .filter(|d| d.decision == Decision::Approve)
            .count()
    }

    fn resolve(&mut self, status: ApprovalStatus, reason: Option<String>, now: DateTime<Utc>) {
        self.approval.status = status;
        self.approval.decided_at = Some(now);
        self.approval.reject_reason = reason;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_types::definition::ApprovalKind;

    fn spec(needed: u32, approvers: &[&str]) -> ApprovalSpec {
        ApprovalSpec {
            enabled: true,
            kind: ApprovalKind::Native,
            timeout_minutes: 30,
            needed_approvers: needed,
            approvers: approvers.iter().map(|a| a.to_string()).collect(),
            description: None,
        }
    }

    fn open(spec: &ApprovalSpec) -> Approval {
        let mut approval = Approval::from(spec);
        ApprovalGate::new(&mut approval).open(Utc::now());
        approval
    }

    fn who(id: &str) -> Decider {
        Decider::new(id, id.to_uppercase())
    }

    #[test]
    fn quorum_of_two_distinct_approvers() {
        let mut approval = open(&spec(2, &[]));
        let mut gate = ApprovalGate::new(&mut approval);
        let now = Utc::now();

        assert_eq!(gate.approve(&who("alice"), None, now).unwrap(), ApprovalStatus::Pending);
        assert_eq!(gate.approve(&who("alice"), None, now).unwrap(), ApprovalStatus::Pending);
        assert_eq!(gate.approve(&who("bob"), None, now).unwrap(), ApprovalStatus::Passed);
        assert_eq!(approval.decisions.len(), 2);
        assert!(approval.decided_at.is_some());
    }

    #[test]
    fn first_rejection_short_circuits() {
        let mut approval = open(&spec(2, &[]));
        let mut gate = ApprovalGate::new(&mut approval);
        let now = Utc::now();

        gate.approve(&who("alice"), None, now).unwrap();
        let status = gate
            .reject(&who("bob"), Some("not today".to_string()), now)
            .unwrap();
        assert_eq!(status, ApprovalStatus::Reject);
        assert_eq!(approval.reject_reason.as_deref(), Some("rejected by BOB: not today"));
    }

    #[test]
    fn replay_after_resolution_returns_prior_outcome() {
        let mut approval = open(&spec(1, &[]));
        let mut gate = ApprovalGate::new(&mut approval);
        let now = Utc::now();

        assert_eq!(gate.approve(&who("alice"), None, now).unwrap(), ApprovalStatus::Passed);
        assert_eq!(gate.reject(&who("alice"), None, now).unwrap(), ApprovalStatus::Passed);
        assert_eq!(
            gate.approve(&who("carol"), None, now),
            Err(ApprovalError::NotOpen(ApprovalStatus::Passed))
        );
        assert_eq!(approval.decisions.len(), 1);
    }

    #[test]
    fn decisions_before_open_are_refused() {
        let mut approval = Approval::from(&spec(1, &[]));
        let mut gate = ApprovalGate::new(&mut approval);
        assert_eq!(
            gate.approve(&who("alice"), None, Utc::now()),
            Err(ApprovalError::NotOpen(ApprovalStatus::Waiting))
        );
    }

    #[test]
    fn only_listed_approvers_may_decide() {
        let mut approval = open(&spec(1, &["alice"]));
        let mut gate = ApprovalGate::new(&mut approval);
        assert_eq!(
            gate.approve(&who("mallory"), None, Utc::now()),
            Err(ApprovalError::NotAllowed("mallory".to_string()))
        );
        assert_eq!(gate.status(), ApprovalStatus::Pending);
    }

    #[test]
    fn disabled_gate_refuses_decisions() {
        let mut disabled = spec(1, &[]);
        disabled.enabled = false;
        let mut approval = Approval::from(&disabled);
        assert_eq!(
            ApprovalGate::new(&mut approval).approve(&who("alice"), None, Utc::now()),
            Err(ApprovalError::Disabled)
        );
    }

    #[test]
    fn deadline_rejects_with_timeout_reason() {
        let mut approval = open(&spec(1, &[]));
        let mut gate = ApprovalGate::new(&mut approval);
        let deadline = gate.deadline().unwrap();

        assert!(!gate.expire(deadline - Duration::seconds(1)));
        assert!(gate.expire(deadline));
        assert_eq!(gate.status(), ApprovalStatus::Reject);
        assert!(!gate.expire(deadline + Duration::minutes(5)));
        assert_eq!(
            approval.reject_reason.as_deref(),
            Some("approval timed out after 30 minutes")
        );
    }

    #[test]
    fn cancel_only_closes_undecided_gates() {
        let mut approval = open(&spec(1, &[]));
        ApprovalGate::new(&mut approval).cancel(Utc::now());
        assert_eq!(approval.status, ApprovalStatus::Cancelled);

        let mut passed = open(&spec(1, &[]));
        let mut gate = ApprovalGate::new(&mut passed);
        gate.approve(&who("alice"), None, Utc::now()).unwrap();
        gate.cancel(Utc::now());
        assert_eq!(passed.status, ApprovalStatus::Passed);
    }

    #[test]
    fn reset_restores_configured_gate() {
        let configured = spec(2, &["alice", "bob"]);
        let mut approval = open(&configured);
        let mut gate = ApprovalGate::new(&mut approval);
        gate.reject(&who("alice"), None, Utc::now()).unwrap();
        gate.reset(&configured);
        assert_eq!(approval, Approval::from(&configured));
    }
}
