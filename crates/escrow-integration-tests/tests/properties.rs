//! Property tests: arbitrary command sequences never break the ledger
//! identity, never leave two active requests, and never half-apply a
//! rejected command.

use escrow_core::{ActorId, DocumentRef, EscrowId};
use escrow_workflow::{
    CreateEscrow, Decision, EscrowError, EscrowService, NewFundRequest, Participant, RequestState,
    WorkflowConfig,
};
use proptest::prelude::*;

const REVIEWERS: [&str; 3] = ["alice", "bob", "carol"];

#[derive(Debug, Clone)]
enum Command {
    Request { by: usize, amount: i64 },
    Review { by: usize, approve: bool },
    Cancel,
    AddCondition { required: bool },
    MeetConditions,
    Reevaluate,
}

fn command() -> impl Strategy<Value = Command> {
    prop_oneof![
        4 => (0..3usize, 1..60_000i64).prop_map(|(by, amount)| Command::Request { by, amount }),
        6 => (0..3usize, prop::bool::weighted(0.8)).prop_map(|(by, approve)| Command::Review { by, approve }),
        1 => Just(Command::Cancel),
        1 => any::<bool>().prop_map(|required| Command::AddCondition { required }),
        1 => Just(Command::MeetConditions),
        1 => Just(Command::Reevaluate),
    ]
}

fn actor(id: &str) -> ActorId {
    ActorId::new(id).unwrap()
}

fn setup(total: i64) -> (EscrowService, EscrowId) {
    let service = EscrowService::new(WorkflowConfig::default());
    let escrow = service
        .create_escrow(
            &actor("alice"),
            CreateEscrow {
                title: "Property".into(),
                custodian_name: "Alice".into(),
                currency: "GBP".into(),
                stakeholders: vec![
                    Participant::new(actor("bob"), "Bob").unwrap(),
                    Participant::new(actor("carol"), "Carol").unwrap(),
                ],
            },
        )
        .unwrap();
    service.fund(escrow.id(), &actor("alice"), total, None).unwrap();
    (service, escrow.id())
}

fn apply(service: &EscrowService, id: EscrowId, cmd: &Command) -> Result<(), EscrowError> {
    let alice = actor("alice");
    let active = service.get_escrow_state(id)?.active_request().map(|r| r.id);
    match cmd {
        Command::Request { by, amount } => {
            let input = NewFundRequest {
                amount: *amount,
                reason: "Draw".into(),
                description: String::new(),
                document_refs: vec![],
            };
            service.create_fund_request(id, &actor(REVIEWERS[*by]), input, None).map(|_| ())
        }
        Command::Review { by, approve } => match active {
            Some(rid) => {
                let decision = if *approve { Decision::Approved } else { Decision::Rejected };
                service
                    .submit_review(id, rid, &actor(REVIEWERS[*by]), decision, None, None)
                    .map(|_| ())
            }
            None => Ok(()),
        },
        Command::Cancel => match active {
            Some(rid) => service.cancel_request(id, rid, &alice, None, None).map(|_| ()),
            None => Ok(()),
        },
        Command::AddCondition { required } => service
            .add_condition(id, &alice, "Survey completed", *required, None)
            .map(|_| ()),
        Command::MeetConditions => {
            let pending: Vec<_> = service
                .get_escrow_state(id)?
                .conditions()
                .iter()
                .map(|c| c.id)
                .collect();
            for cid in pending {
                service.mark_condition_met(id, &alice, cid, DocumentRef::new("survey.pdf")?, None)?;
            }
            Ok(())
        }
        Command::Reevaluate => match active {
            Some(rid) => service.reevaluate_request(id, rid, &alice, None).map(|_| ()),
            None => Ok(()),
        },
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn ledger_identity_holds_for_any_command_sequence(
        total in 1_000i64..200_000,
        commands in prop::collection::vec(command(), 1..40),
    ) {
        let (service, id) = setup(total);
        let mut released_by_requests = 0i64;

        for cmd in &commands {
            let before = service.get_escrow_state(id).unwrap();
            let result = apply(&service, id, cmd);
            let after = service.get_escrow_state(id).unwrap();

            if let Err(e) = &result {
                prop_assert!(!e.is_fatal(), "fatal error: {e}");
                if !matches!(cmd, Command::MeetConditions) {
                    prop_assert_eq!(&*after, &*before);
                }
            }

            let ledger = after.ledger();
            prop_assert_eq!(
                ledger.total_amount().value(),
                ledger.released_amount().value() + ledger.remaining_amount().value()
            );
            prop_assert!(ledger.remaining_amount().value() >= 0);
            prop_assert!(after.fund_requests().iter().filter(|r| r.state().is_active()).count() <= 1);

            released_by_requests = after
                .fund_requests()
                .iter()
                .filter(|r| r.state() == RequestState::Approved)
                .map(|r| r.amount.value())
                .sum();
            prop_assert_eq!(released_by_requests, ledger.released_amount().value());
        }
        prop_assert!(released_by_requests <= total);
        prop_assert_eq!(service.verify_audit_chain(id).unwrap(), service.get_audit_trail(id, 1).unwrap().len() as u64);
    }

    #[test]
    fn requests_over_remaining_are_refused(
        total in 1i64..1_000_000,
        excess in 1i64..1_000_000,
    ) {
        let (service, id) = setup(total);
        let version = service.get_escrow_state(id).unwrap().version();
        let input = NewFundRequest {
            amount: total + excess,
            reason: "Too much".into(),
            description: String::new(),
            document_refs: vec![],
        };
        let err = service.create_fund_request(id, &actor("bob"), input, None).unwrap_err();
        prop_assert!(matches!(err, EscrowError::InsufficientFunds { .. }), "unexpected error: {err:?}");
        let escrow = service.get_escrow_state(id).unwrap();
        prop_assert_eq!(escrow.version(), version);
        prop_assert!(escrow.fund_requests().is_empty());
    }

    #[test]
    fn unanimity_law(decisions in prop::collection::vec(prop::bool::weighted(0.7), 3)) {
        let (service, id) = setup(10_000);
        let input = NewFundRequest {
            amount: 1_000,
            reason: "Draw".into(),
            description: String::new(),
            document_refs: vec![],
        };
        let (_, rid) = service.create_fund_request(id, &actor("bob"), input, None).unwrap();

        let mut state = RequestState::Created;
        for (who, approve) in REVIEWERS.iter().zip(&decisions) {
            let decision = if *approve { Decision::Approved } else { Decision::Rejected };
            state = service.submit_review(id, rid, &actor(who), decision, None, None).unwrap().1;
            if !approve {
                break;
            }
        }

        let expected = if decisions.iter().all(|d| *d) {
            RequestState::Approved
        } else {
            RequestState::Rejected
        };
        prop_assert_eq!(state, expected);
    }
}
