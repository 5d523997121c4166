use mockall::{
    predicate::{always, eq},
    Sequence,
};

use fedlite_core::{
    CompressType,
    EncryptLevel,
    ResponseCode,
    RoundStatus,
    ServerMode,
};

use crate::{
    message::{FlPlan, PrivacyParams, Reply, ResponseFlJob, WirePwParams},
    runtime::ModelTarget,
    state_machine::{
        phase::now_ms,
        tests::utils::{feature_names, prime_bytes, shared_state, weights, FEATURE_SIZE, FL_ID},
        IntoPhase,
        MockIO,
        Phase,
        SharedState,
        StartJob,
        State,
    },
    unwrap_step,
};

fn make_phase_with(shared: Box<SharedState>) -> Phase<StartJob> {
    // Check IntoPhase<StartJob> implementation: no notification
    let mock = MockIO::new();
    let mut phase: Phase<StartJob> = State::new(shared, Box::new(StartJob)).into_phase(Box::new(mock));
    phase.check_io_mock();
    phase
}

fn make_phase() -> Phase<StartJob> {
    make_phase_with(shared_state())
}

fn fl_plan(encrypt_type: &str) -> FlPlan {
    FlPlan {
        fl_name: "lenet".to_string(),
        iterations: 5,
        epochs: 1,
        batch_size: 32,
        lr: 0.01,
        server_mode: "FEDERATED_LEARNING".to_string(),
        encrypt_type: encrypt_type.to_string(),
        pw_params: Some(WirePwParams {
            t: 2,
            prime: prime_bytes(),
        }),
        dp_params: None,
        ds_params: None,
    }
}

fn job(encrypt_type: &str) -> ResponseFlJob {
    ResponseFlJob {
        retcode: ResponseCode::Succeed,
        iteration: 4,
        is_selected: true,
        fl_plan_config: Some(fl_plan(encrypt_type)),
        update_feature_names: feature_names(),
        upload_compress_type: "NO_COMPRESS".to_string(),
        ..Default::default()
    }
}

/// Expect the device to join a round with the given job.
fn expect_join(mock: &mut MockIO, response: ResponseFlJob) {
    let mut seq = Sequence::new();
    mock.expect_start_fl_job()
        .times(1)
        .in_sequence(&mut seq)
        .withf(|req| {
            req.fl_id == FL_ID
                && req.fl_name == "lenet"
                && req.iteration == 1
                && req.data_size == 64
                && req.identity_proof.is_none()
        })
        .return_once(move |_| Ok(Reply::Message(response)));
    mock.expect_features()
        .times(1)
        .in_sequence(&mut seq)
        .with(eq(ModelTarget::Train), always())
        .returning(|_, _| Ok(weights()));
    mock.expect_notify_new_round()
        .times(1)
        .in_sequence(&mut seq)
        .with(eq(4))
        .return_const(());
}

#[tokio::test]
async fn test_join_round() {
    let mut phase = make_phase();
    phase.with_io_mock(|mock| expect_join(mock, job("NOT_ENCRYPT")));

    let mut phase = unwrap_step!(phase, complete, mask_setup);
    phase.check_io_mock();

    let round = &phase.state.shared.round;
    assert_eq!(round.iteration, 4);
    assert_eq!(round.iterations, 5);
    assert_eq!(round.status, RoundStatus::Success);
    assert_eq!(round.code, ResponseCode::Succeed);

    let context = &phase.state.private.context;
    assert_eq!(context.plan.privacy, PrivacyParams::NotEncrypt);
    assert_eq!(context.plan.server_mode, ServerMode::FederatedLearning);
    assert_eq!(context.feature_names, feature_names());
    assert_eq!(context.feature_size, FEATURE_SIZE);
    assert_eq!(context.compress_type, CompressType::NoCompress);
    assert!(context.session.is_none());
    assert!(!phase.state.private.keys_sent);
}

#[tokio::test]
async fn test_join_pairwise_masked_round() {
    let mut phase = make_phase();
    phase.with_io_mock(|mock| expect_join(mock, job("PW_ENCRYPT")));

    let mut phase = unwrap_step!(phase, complete, mask_setup);
    phase.check_io_mock();

    let context = &phase.state.private.context;
    assert_eq!(context.plan.privacy.level(), EncryptLevel::PwEncrypt);
    let session = context.session.as_ref().unwrap();
    assert_eq!(session.fl_id(), FL_ID);
    assert_eq!(session.iteration(), 4);
    assert_eq!(session.config().feature_size, FEATURE_SIZE);
}

#[tokio::test]
async fn test_compression_needs_plain_upload() {
    let mut response = job("DP_ENCRYPT");
    response.upload_compress_type = "DIFF_SPARSE_QUANT".to_string();
    response.upload_sparse_rate = 0.4;
    let mut phase = make_phase();
    phase.with_io_mock(|mock| expect_join(mock, response));

    let mut phase = unwrap_step!(phase, complete, mask_setup);
    phase.check_io_mock();

    let context = &phase.state.private.context;
    assert_eq!(context.plan.privacy.level(), EncryptLevel::DpEncrypt);
    assert_eq!(context.compress_type, CompressType::NoCompress);
}

#[tokio::test]
async fn test_apply_global_features() {
    let mut response = job("");
    response.fl_plan_config.as_mut().unwrap().server_mode = "HYBRID_TRAINING".to_string();
    response.feature_map = weights();
    response.update_feature_names = Vec::new();

    let mut phase = make_phase();
    phase.with_io_mock(|mock| {
        let mut seq = Sequence::new();
        mock.expect_start_fl_job()
            .times(1)
            .in_sequence(&mut seq)
            .return_once(move |_| Ok(Reply::Message(response)));
        mock.expect_update_features()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|target, features| *target == ModelTarget::Train && *features == weights())
            .returning(|_, _| Ok(()));
        mock.expect_update_features()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|target, features| *target == ModelTarget::Infer && *features == weights())
            .returning(|_, _| Ok(()));
        mock.expect_features()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|target, names| *target == ModelTarget::Train && names.is_empty())
            .returning(|_, _| Ok(weights()));
        mock.expect_notify_new_round()
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());
    });

    let mut phase = unwrap_step!(phase, complete, mask_setup);
    phase.check_io_mock();

    let context = &phase.state.private.context;
    assert_eq!(context.plan.server_mode, ServerMode::HybridTraining);
    // no names selects all the features of the model
    assert_eq!(context.feature_names.len(), 3);
    assert_eq!(context.feature_size, FEATURE_SIZE + 1);
    // an empty privacy mode falls back to the task settings
    assert_eq!(context.plan.privacy, PrivacyParams::NotEncrypt);
}

#[tokio::test]
async fn test_not_selected() {
    let response = ResponseFlJob {
        retcode: ResponseCode::Succeed,
        iteration: 4,
        is_selected: false,
        next_req_time: 1234,
        ..Default::default()
    };
    let mut phase = make_phase();
    phase.with_io_mock(|mock| {
        mock.expect_start_fl_job()
            .times(1)
            .return_once(move |_| Ok(Reply::Message(response)));
    });

    let mut phase = unwrap_step!(phase, complete, start_job);
    phase.check_io_mock();

    let round = &phase.state.shared.round;
    assert_eq!(round.status, RoundStatus::Restart);
    assert_eq!(round.next_request_time, Some(1234));
    assert_eq!(round.iteration, 4);
}

#[tokio::test]
async fn test_out_of_time() {
    let response = ResponseFlJob {
        retcode: ResponseCode::OutOfTime,
        reason: "the round is over".to_string(),
        iteration: 7,
        next_req_time: 5678,
        ..Default::default()
    };
    let mut phase = make_phase();
    phase.with_io_mock(|mock| {
        mock.expect_start_fl_job()
            .times(1)
            .return_once(move |_| Ok(Reply::Message(response)));
    });

    let mut phase = unwrap_step!(phase, complete, start_job);
    phase.check_io_mock();

    let round = &phase.state.shared.round;
    assert_eq!(round.status, RoundStatus::Restart);
    assert_eq!(round.code, ResponseCode::OutOfTime);
    assert_eq!(round.next_request_time, Some(5678));
    assert_eq!(round.iteration, 7);
}

#[tokio::test]
async fn test_coordinator_not_ready() {
    let mut phase = make_phase();
    phase.with_io_mock(|mock| {
        mock.expect_start_fl_job()
            .times(1)
            .returning(|_| Ok(Reply::NotReady));
    });

    let before = now_ms();
    let mut phase = unwrap_step!(phase, complete, start_job);
    phase.check_io_mock();

    let round = &phase.state.shared.round;
    let delay = phase.state.shared.task.not_ready_delay_ms;
    assert_eq!(round.status, RoundStatus::Restart);
    assert_eq!(round.code, ResponseCode::OutOfTime);
    assert!(round.next_request_time.unwrap() >= before + delay);
}

#[tokio::test]
async fn test_job_not_available() {
    let mut phase = make_phase();
    phase.with_io_mock(|mock| {
        let mut seq = Sequence::new();
        mock.expect_start_fl_job()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(Reply::JobNotAvailable));
        mock.expect_notify_failed()
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());
    });

    let mut phase = unwrap_step!(phase, complete, failed);
    phase.check_io_mock();

    let failure = &phase.state.private.failure;
    assert!(failure.task_fatal);
    assert_eq!(failure.code, ResponseCode::SystemError);
    assert_eq!(phase.state.shared.round.status, RoundStatus::Failed);
}

#[tokio::test]
async fn test_request_error() {
    let mut phase = make_phase();
    phase.with_io_mock(|mock| {
        let mut seq = Sequence::new();
        mock.expect_start_fl_job()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err("connection refused".into()));
        mock.expect_notify_failed()
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());
    });

    let mut phase = unwrap_step!(phase, complete, failed);
    phase.check_io_mock();

    let failure = &phase.state.private.failure;
    assert!(!failure.task_fatal);
    assert_eq!(failure.code, ResponseCode::RequestError);
    assert!(failure.reason.contains("connection refused"));
}

#[tokio::test]
async fn test_system_error() {
    let response = ResponseFlJob {
        retcode: ResponseCode::SystemError,
        reason: "the coordinator is broken".to_string(),
        ..Default::default()
    };
    let mut phase = make_phase();
    phase.with_io_mock(|mock| {
        mock.expect_start_fl_job()
            .times(1)
            .return_once(move |_| Ok(Reply::Message(response)));
        mock.expect_notify_failed().times(1).return_const(());
    });

    let mut phase = unwrap_step!(phase, complete, failed);
    phase.check_io_mock();

    let failure = &phase.state.private.failure;
    assert!(failure.task_fatal);
    assert_eq!(failure.reason, "the coordinator is broken");
}

#[tokio::test]
async fn test_missing_plan() {
    let mut response = job("NOT_ENCRYPT");
    response.fl_plan_config = None;
    let mut phase = make_phase();
    phase.with_io_mock(|mock| {
        mock.expect_start_fl_job()
            .times(1)
            .return_once(move |_| Ok(Reply::Message(response)));
        mock.expect_notify_failed().times(1).return_const(());
    });

    let mut phase = unwrap_step!(phase, complete, failed);
    phase.check_io_mock();

    let failure = &phase.state.private.failure;
    assert!(!failure.task_fatal);
    assert_eq!(failure.code, ResponseCode::RequestError);
}

#[tokio::test]
async fn test_missing_feature() {
    let mut response = job("NOT_ENCRYPT");
    response.update_feature_names.push("lstm.weight".to_string());
    let mut phase = make_phase();
    phase.with_io_mock(|mock| {
        mock.expect_start_fl_job()
            .times(1)
            .return_once(move |_| Ok(Reply::Message(response)));
        mock.expect_features().times(1).returning(|_, _| Ok(weights()));
        mock.expect_notify_failed().times(1).return_const(());
    });

    let mut phase = unwrap_step!(phase, complete, failed);
    phase.check_io_mock();
    assert_eq!(phase.state.private.failure.code, ResponseCode::RequestError);
}

#[tokio::test]
async fn test_identity_proof() {
    let mut shared = shared_state();
    shared.identity = Some(fedlite_core::crypto::SigningKeyPair::generate());
    let public = shared.identity.as_ref().unwrap().public;
    let mut phase = make_phase_with(shared);

    phase.with_io_mock(|mock| {
        mock.expect_start_fl_job()
            .times(1)
            .withf(move |req| {
                let proof = match &req.identity_proof {
                    Some(proof) => proof,
                    None => return false,
                };
                proof.public_key == public
                    && public.verify(&proof.signature, &req.fl_id, req.timestamp, req.iteration)
            })
            .returning(|_| Ok(Reply::NotReady));
    });

    let mut phase = unwrap_step!(phase, complete, start_job);
    phase.check_io_mock();
}

#[tokio::test]
async fn test_stopped_task() {
    let phase = make_phase();
    phase.state.shared.stop.stop();
    let mut phase = phase;
    phase.with_io_mock(|mock| {
        mock.expect_notify_failed().times(1).return_const(());
    });

    let state_machine = match phase.step().await {
        crate::state_machine::TransitionOutcome::Complete(state_machine) => state_machine,
        _ => panic!("the stopped round must complete"),
    };
    let failure = state_machine.failure().unwrap();
    assert!(failure.task_fatal);
    assert_eq!(failure.reason, "the task was stopped");
}
