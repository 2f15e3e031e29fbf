use std::time::Duration;

use arbor_core::types::StepId;
use arbor_core::vote::VoteType;

/// The five agreement phases of one round.
///
/// Steps 1–3 run once each; from step 4 on, even Finish and odd Polling
/// steps alternate until the round ends by next-vote supermajority or
/// commit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    Propose,
    Filter,
    Certify,
    Finish(StepId),
    Polling(StepId),
}

impl Step {
    pub fn id(&self) -> StepId {
        match self {
            Step::Propose => 1,
            Step::Filter => 2,
            Step::Certify => 3,
            Step::Finish(id) | Step::Polling(id) => *id,
        }
    }

    pub fn from_id(id: StepId) -> Step {
        match id {
            0 | 1 => Step::Propose,
            2 => Step::Filter,
            3 => Step::Certify,
            id if id % 2 == 0 => Step::Finish(id),
            id => Step::Polling(id),
        }
    }

    pub fn next(&self) -> Step {
        match self {
            Step::Propose => Step::Filter,
            Step::Filter => Step::Certify,
            Step::Certify => Step::Finish(4),
            Step::Finish(id) => Step::Polling(id + 1),
            Step::Polling(id) => Step::Finish(id + 1),
        }
    }

    /// Vote type this step emits.
    pub fn vote_type(&self) -> VoteType {
        match self {
            Step::Propose => VoteType::Propose,
            Step::Filter => VoteType::Soft,
            Step::Certify => VoteType::Cert,
            Step::Finish(_) | Step::Polling(_) => VoteType::Next,
        }
    }

    /// When, relative to round start, this step hands over to the next one.
    ///
    /// Propose runs in [0, 2λ), Filter in [2λ, 3λ), Certify in [3λ, 4λ); a
    /// Finish step acts immediately and its Polling twin polls until
    /// (k+1)·λ.
    pub fn end_offset(&self, lambda: Duration) -> Duration {
        match self {
            Step::Propose => 2 * lambda,
            Step::Filter => 3 * lambda,
            Step::Certify => 4 * lambda,
            Step::Finish(id) => (*id as u32) * lambda,
            Step::Polling(id) => (*id as u32 + 1) * lambda,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_round_trip() {
        for id in 1..=12 {
            assert_eq!(Step::from_id(id).id(), id);
        }
        assert_eq!(Step::from_id(4), Step::Finish(4));
        assert_eq!(Step::from_id(5), Step::Polling(5));
    }

    #[test]
    fn sequence_alternates_after_certify() {
        let mut step = Step::Propose;
        let mut ids = vec![step.id()];
        for _ in 0..6 {
            step = step.next();
            ids.push(step.id());
        }
        assert_eq!(ids, vec![1, 2, 3, 4, 5, 6, 7]);
        assert!(matches!(Step::from_id(6), Step::Finish(6)));
    }

    #[test]
    fn vote_types_match_phases() {
        assert_eq!(Step::Propose.vote_type(), VoteType::Propose);
        assert_eq!(Step::Filter.vote_type(), VoteType::Soft);
        assert_eq!(Step::Certify.vote_type(), VoteType::Cert);
        assert_eq!(Step::Finish(4).vote_type(), VoteType::Next);
        assert_eq!(Step::Polling(5).vote_type(), VoteType::Next);
    }

    #[test]
    fn timing_boundaries() {
        let lambda = Duration::from_millis(500);
        assert_eq!(Step::Propose.end_offset(lambda), Duration::from_millis(1000));
        assert_eq!(Step::Filter.end_offset(lambda), Duration::from_millis(1500));
        assert_eq!(Step::Certify.end_offset(lambda), Duration::from_millis(2000));
        assert_eq!(Step::Polling(5).end_offset(lambda), Duration::from_millis(3000));
    }
}
