use mockall::Sequence;

use fedlite_core::{
    secagg::{CipherSession, ClientKeys},
    ResponseCode,
    RoundStatus,
};

use crate::{
    message::{
        PrivacyParams,
        Reply,
        ResponseExchangeKeys,
        ResponseGetKeys,
        ResponseGetSecrets,
        ResponseShareSecrets,
    },
    save_and_restore,
    state_machine::{
        tests::utils::{
            peer_shares,
            peers,
            pw_round_context,
            round_context,
            shared_state,
            FEATURE_SIZE,
            FL_ID,
        },
        IntoPhase,
        MaskSetup,
        MockIO,
        Phase,
        State,
    },
    unwrap_progress_continue,
    unwrap_step,
};

/// Instantiate a mask setup phase with a fresh secure aggregation session.
fn make_phase() -> Phase<MaskSetup> {
    let mask_setup = MaskSetup::new(pw_round_context());

    // Check IntoPhase<MaskSetup> implementation: no notification
    let mock = MockIO::new();
    let mut phase: Phase<MaskSetup> =
        State::new(shared_state(), Box::new(mask_setup)).into_phase(Box::new(mock));
    phase.check_io_mock();
    phase
}

/// The public keys of the device and of its peers.
fn all_keys(phase: &Phase<MaskSetup>, peers: &[CipherSession]) -> Vec<ClientKeys> {
    let session = phase.state.private.context.session.as_ref().unwrap();
    std::iter::once(session.public_keys())
        .chain(peers.iter().map(CipherSession::public_keys))
        .collect()
}

async fn step1_send_keys(mut phase: Phase<MaskSetup>) -> Phase<MaskSetup> {
    let keys = phase
        .state
        .private
        .context
        .session
        .as_ref()
        .unwrap()
        .public_keys();
    phase.with_io_mock(|mock| {
        mock.expect_exchange_keys()
            .times(1)
            .withf(move |req| req.fl_id == FL_ID && req.iteration == 1 && req.keys == keys)
            .returning(|_| Ok(Reply::Message(ResponseExchangeKeys::default())));
    });

    let phase = unwrap_step!(phase, complete, mask_setup);
    assert!(phase.state.private.keys_sent);

    // Calling `send_keys` again should return Progress::Continue
    let mut phase = unwrap_progress_continue!(phase, send_keys, async);
    phase.check_io_mock();
    phase
}

async fn step2_fetch_peers(mut phase: Phase<MaskSetup>, keys: Vec<ClientKeys>) -> Phase<MaskSetup> {
    phase.with_io_mock(|mock| {
        let mut seq = Sequence::new();
        // The first time, pretend the other clients didn't send their keys yet
        mock.expect_get_keys()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| {
                Ok(Reply::Message(ResponseGetKeys {
                    retcode: ResponseCode::SucNotReady,
                    ..Default::default()
                }))
            });
        // The second time, return the keys
        mock.expect_get_keys()
            .times(1)
            .in_sequence(&mut seq)
            .return_once(move |_| {
                Ok(Reply::Message(ResponseGetKeys {
                    keys,
                    ..Default::default()
                }))
            });
    });

    // First time: no progress should be made
    let phase = unwrap_step!(phase, pending, mask_setup);
    assert_eq!(phase.state.shared.round.status, RoundStatus::Wait);
    assert_eq!(phase.state.shared.round.code, ResponseCode::SucNotReady);
    // The keys were sent already, so the same request is retried
    assert!(!phase.state.private.peers_fetched);

    // Second time: now the state machine should have made progress
    let phase = unwrap_step!(phase, complete, mask_setup);
    assert!(phase.state.private.peers_fetched);
    assert_eq!(
        phase.state.private.context.session.as_ref().unwrap().peers().len(),
        3
    );

    let mut phase = unwrap_progress_continue!(phase, fetch_peers, async);
    phase.check_io_mock();
    phase
}

async fn step3_send_shares(mut phase: Phase<MaskSetup>) -> Phase<MaskSetup> {
    phase.with_io_mock(|mock| {
        mock.expect_share_secrets()
            .times(1)
            .withf(|req| {
                // one share for each peer, the device keeps its own
                req.shares.len() == 2 && req.shares.iter().all(|share| share.sender == FL_ID)
            })
            .returning(|_| Ok(Reply::Message(ResponseShareSecrets::default())));
    });

    let phase = unwrap_step!(phase, complete, mask_setup);
    assert!(phase.state.private.shares_sent);

    let mut phase = unwrap_progress_continue!(phase, send_shares, async);
    phase.check_io_mock();
    phase
}

async fn step4_receive_shares(
    mut phase: Phase<MaskSetup>,
    peers: &mut [CipherSession],
    keys: &[ClientKeys],
) -> Phase<MaskSetup> {
    let shares = peer_shares(peers, keys);
    phase.with_io_mock(|mock| {
        let mut seq = Sequence::new();
        mock.expect_get_secrets()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(Reply::NotReady));
        mock.expect_get_secrets()
            .times(1)
            .in_sequence(&mut seq)
            .return_once(move |_| {
                Ok(Reply::Message(ResponseGetSecrets {
                    shares,
                    ..Default::default()
                }))
            });
    });

    let phase = unwrap_step!(phase, pending, mask_setup);
    let phase = unwrap_step!(phase, complete, mask_setup);
    assert!(phase.state.private.shares_received);

    let mut phase = unwrap_progress_continue!(phase, receive_shares, async);
    phase.check_io_mock();
    phase
}

async fn step5_compute_mask(mut phase: Phase<MaskSetup>) {
    phase.with_io_mock(|mock| {
        mock.expect_notify_train().times(1).return_const(());
    });

    let mut phase = unwrap_step!(phase, complete, train);
    phase.check_io_mock();

    let mask = phase.state.private.mask.as_ref().unwrap();
    assert_eq!(mask.len(), FEATURE_SIZE);
    assert_eq!(phase.state.shared.round.status, RoundStatus::Success);
}

#[tokio::test]
async fn test_mask_setup_phase() {
    let mut peers = peers();
    let phase = make_phase();
    let keys = all_keys(&phase, &peers);

    let phase = step1_send_keys(phase).await;
    let phase = step2_fetch_peers(phase, keys.clone()).await;
    let phase = step3_send_shares(phase).await;
    let phase = step4_receive_shares(phase, &mut peers, &keys).await;
    step5_compute_mask(phase).await;
}

#[tokio::test]
async fn test_save_and_restore() {
    let mut peers = peers();
    let phase = make_phase();
    let keys = all_keys(&phase, &peers);

    let phase = step1_send_keys(phase).await;
    let phase = save_and_restore!(phase, MaskSetup);
    let phase = step2_fetch_peers(phase, keys.clone()).await;
    let phase = save_and_restore!(phase, MaskSetup);
    let phase = step3_send_shares(phase).await;
    let phase = save_and_restore!(phase, MaskSetup);
    let phase = step4_receive_shares(phase, &mut peers, &keys).await;
    let phase = save_and_restore!(phase, MaskSetup);
    step5_compute_mask(phase).await;
}

#[tokio::test]
async fn test_no_pairwise_masking() {
    let mask_setup = MaskSetup::new(round_context(PrivacyParams::NotEncrypt));
    let mut phase: Phase<MaskSetup> = State::new(shared_state(), Box::new(mask_setup))
        .into_phase(Box::new(MockIO::new()));
    phase.with_io_mock(|mock| {
        mock.expect_notify_train().times(1).return_const(());
    });

    let mut phase = unwrap_step!(phase, complete, train);
    phase.check_io_mock();
    assert!(phase.state.private.mask.is_none());
}

#[tokio::test]
async fn test_restart_when_not_ready() {
    let mut phase = make_phase();
    phase.with_io_mock(|mock| {
        mock.expect_exchange_keys()
            .times(1)
            .returning(|_| Ok(Reply::NotReady));
    });

    let mut phase = unwrap_step!(phase, complete, start_job);
    phase.check_io_mock();

    let round = &phase.state.shared.round;
    assert_eq!(round.status, RoundStatus::Restart);
    assert_eq!(round.code, ResponseCode::OutOfTime);
    assert!(round.next_request_time.is_some());
}

#[tokio::test]
async fn test_keys_without_the_device() {
    let peers = peers();
    let phase = make_phase();
    let keys: Vec<ClientKeys> = peers.iter().map(CipherSession::public_keys).collect();

    let mut phase = step1_send_keys(phase).await;
    phase.with_io_mock(|mock| {
        let mut seq = Sequence::new();
        mock.expect_get_keys()
            .times(1)
            .in_sequence(&mut seq)
            .return_once(move |_| {
                Ok(Reply::Message(ResponseGetKeys {
                    keys,
                    ..Default::default()
                }))
            });
        mock.expect_notify_failed()
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());
    });

    let mut phase = unwrap_step!(phase, complete, failed);
    phase.check_io_mock();

    let failure = &phase.state.private.failure;
    assert_eq!(failure.code, ResponseCode::RequestError);
    assert!(!failure.task_fatal);
}
