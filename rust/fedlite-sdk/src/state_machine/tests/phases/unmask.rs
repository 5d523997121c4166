use mockall::Sequence;

use fedlite_core::{
    secagg::{RevealedShare, SecretKind},
    ResponseCode,
    RoundStatus,
};

use crate::{
    message::{PrivacyParams, Reply, ResponseClientList, ResponseReconstructSecrets},
    save_and_restore,
    state_machine::{
        tests::utils::{pw_params, ready_session, round_context, shared_state, FL_ID},
        IntoPhase,
        MockIO,
        Phase,
        State,
        Unmask,
    },
    unwrap_progress_continue,
    unwrap_step,
};

fn make_phase() -> Phase<Unmask> {
    let mut context = round_context(PrivacyParams::PwEncrypt(pw_params()));
    context.session = Some(ready_session());

    // Check IntoPhase<Unmask> implementation: no notification
    let mock = MockIO::new();
    let mut phase: Phase<Unmask> =
        State::new(shared_state(), Box::new(Unmask::new(context))).into_phase(Box::new(mock));
    phase.check_io_mock();
    phase
}

fn survivors() -> Vec<String> {
    vec![FL_ID.to_string(), "device-1".to_string()]
}

async fn step1_fetch_survivors(mut phase: Phase<Unmask>) -> Phase<Unmask> {
    phase.with_io_mock(|mock| {
        let mut seq = Sequence::new();
        // The first time, pretend the coordinator is still collecting updates
        mock.expect_get_client_list()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(Reply::NotReady));
        mock.expect_get_client_list()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|req| req.fl_id == FL_ID && req.iteration == 1)
            .returning(|_| {
                Ok(Reply::Message(ResponseClientList {
                    clients: survivors(),
                    ..Default::default()
                }))
            });
    });

    let phase = unwrap_step!(phase, pending, unmask);
    assert_eq!(phase.state.shared.round.status, RoundStatus::Wait);
    let phase = unwrap_step!(phase, complete, unmask);
    assert_eq!(phase.state.private.survivors, Some(survivors()));

    let mut phase = unwrap_progress_continue!(phase, fetch_survivors, async);
    phase.check_io_mock();
    phase
}

/// The shares are revealed by secret kind: the individual seed of the
/// survivors and the agreement key of the dropped clients.
fn is_expected_reveal(shares: &[RevealedShare]) -> bool {
    let kind_of = |owner: &str| {
        shares
            .iter()
            .find(|share| share.owner == owner)
            .map(|share| share.kind)
    };
    shares.len() == 3
        && kind_of(FL_ID) == Some(SecretKind::IndividualSeed)
        && kind_of("device-1") == Some(SecretKind::IndividualSeed)
        && kind_of("device-2") == Some(SecretKind::AgreementKey)
}

async fn step2_reveal_shares(mut phase: Phase<Unmask>) {
    phase.with_io_mock(|mock| {
        mock.expect_reconstruct_secrets()
            .times(1)
            .withf(|req| is_expected_reveal(&req.shares))
            .returning(|_| Ok(Reply::Message(ResponseReconstructSecrets::default())));
    });

    let mut phase = unwrap_step!(phase, complete, download);
    phase.check_io_mock();
    assert!(!phase.state.private.result_ready);
    assert_eq!(phase.state.shared.round.status, RoundStatus::Success);
}

#[tokio::test]
async fn test_unmask_phase() {
    let phase = make_phase();
    let phase = step1_fetch_survivors(phase).await;
    step2_reveal_shares(phase).await;
}

#[tokio::test]
async fn test_save_and_restore() {
    let phase = make_phase();
    let phase = save_and_restore!(phase, Unmask);
    let phase = step1_fetch_survivors(phase).await;
    let phase = save_and_restore!(phase, Unmask);
    step2_reveal_shares(phase).await;
}

#[tokio::test]
async fn test_no_pairwise_masking() {
    let unmask = Unmask::new(round_context(PrivacyParams::NotEncrypt));
    let phase: Phase<Unmask> =
        State::new(shared_state(), Box::new(unmask)).into_phase(Box::new(MockIO::new()));

    let mut phase = unwrap_step!(phase, complete, download);
    phase.check_io_mock();
}

#[tokio::test]
async fn test_device_dropped() {
    let mut phase = make_phase();
    phase.with_io_mock(|mock| {
        let mut seq = Sequence::new();
        mock.expect_get_client_list()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| {
                Ok(Reply::Message(ResponseClientList {
                    clients: vec!["device-1".to_string(), "device-2".to_string()],
                    ..Default::default()
                }))
            });
        mock.expect_notify_failed()
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());
    });

    // The device fetches the survivors in a first step...
    let phase = unwrap_step!(phase, complete, unmask);
    // ...but can't reveal anything when its own update didn't make it
    let mut phase = unwrap_step!(phase, complete, failed);
    phase.check_io_mock();
    assert_eq!(phase.state.private.failure.code, ResponseCode::RequestError);
}

#[tokio::test]
async fn test_reveal_restarts_when_not_ready() {
    let phase = make_phase();
    let mut phase = step1_fetch_survivors(phase).await;
    phase.with_io_mock(|mock| {
        mock.expect_reconstruct_secrets()
            .times(1)
            .returning(|_| Ok(Reply::NotReady));
    });

    let mut phase = unwrap_step!(phase, complete, start_job);
    phase.check_io_mock();
    assert_eq!(phase.state.shared.round.status, RoundStatus::Restart);
}
