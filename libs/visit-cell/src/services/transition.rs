use tracing::warn;

use crate::error::VisitError;
use crate::models::VisitStatus;

/// The status a visit moves to on "advance". `None` means there is no
/// advance action; the procedure branch is only entered by explicit assignment.
pub fn next_status(current: VisitStatus) -> Option<VisitStatus> {
    match current {
        VisitStatus::Registered => Some(VisitStatus::InQueue),
        VisitStatus::InQueue => Some(VisitStatus::VitalSigns),
        VisitStatus::VitalSigns => Some(VisitStatus::WaitingForDoctor),
        VisitStatus::WaitingForDoctor => Some(VisitStatus::InConsultation),
        VisitStatus::InConsultation => Some(VisitStatus::Diagnosing),
        VisitStatus::Diagnosing => Some(VisitStatus::Ordering),
        VisitStatus::Ordering => Some(VisitStatus::OrderConfirmed),
        VisitStatus::OrderConfirmed => Some(VisitStatus::AwaitingPayment),
        VisitStatus::PerformingProcedure => Some(VisitStatus::ProcedureCompleted),
        VisitStatus::ProcedureCompleted => Some(VisitStatus::AwaitingPayment),
        VisitStatus::AwaitingPayment => Some(VisitStatus::PaymentProcessed),
        VisitStatus::PaymentProcessed => Some(VisitStatus::Dispensing),
        VisitStatus::Dispensing => Some(VisitStatus::Completed),
        VisitStatus::Completed => None,
    }
}

/// Explicit assignment may jump ahead (e.g. into the procedure branch) but never back.
pub fn validate_assignment(current: VisitStatus, target: VisitStatus) -> Result<(), VisitError> {
    if target.rank() > current.rank() {
        Ok(())
    } else {
        warn!("Rejected status change from {} to {}", current, target);
        Err(VisitError::InvalidTransition { from: current, to: target })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn only_completed_has_no_successor() {
        for status in VisitStatus::ALL {
            assert_eq!(next_status(status).is_none(), status == VisitStatus::Completed, "{}", status);
        }
    }

    #[test]
    fn successors_always_move_forward() {
        for status in VisitStatus::ALL {
            if let Some(next) = next_status(status) {
                assert!(next.rank() > status.rank(), "{} -> {}", status, next);
                assert!(validate_assignment(status, next).is_ok());
            }
        }
    }

    #[test]
    fn advancing_skips_procedure_branch() {
        assert_eq!(next_status(VisitStatus::OrderConfirmed), Some(VisitStatus::AwaitingPayment));
        assert_eq!(next_status(VisitStatus::ProcedureCompleted), Some(VisitStatus::AwaitingPayment));
    }

    #[test]
    fn every_advance_chain_ends_at_completed() {
        for start in VisitStatus::ALL {
            let mut current = start;
            let mut steps = 0;
            while let Some(next) = next_status(current) {
                current = next;
                steps += 1;
                assert!(steps <= VisitStatus::ALL.len());
            }
            assert_eq!(current, VisitStatus::Completed);
        }

        let mut status = VisitStatus::Registered;
        let mut path = vec![status];
        while let Some(next) = next_status(status) {
            status = next;
            path.push(status);
        }
        assert_eq!(path.len(), 12);
        assert!(!path.contains(&VisitStatus::PerformingProcedure));
    }

    #[test]
    fn assignment_rejects_backward_and_same() {
        assert!(validate_assignment(VisitStatus::OrderConfirmed, VisitStatus::PerformingProcedure).is_ok());
        assert_matches!(
            validate_assignment(VisitStatus::Dispensing, VisitStatus::InQueue),
            Err(VisitError::InvalidTransition { from: VisitStatus::Dispensing, to: VisitStatus::InQueue })
        );
        assert!(validate_assignment(VisitStatus::Ordering, VisitStatus::Ordering).is_err());
        assert!(validate_assignment(VisitStatus::Completed, VisitStatus::Completed).is_err());
    }
}
