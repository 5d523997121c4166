use mockall::Sequence;

use fedlite_core::{
    mask::{mask_weight, FeatureMask},
    CompressType,
    FeatureMap,
    ResponseCode,
    RoundStatus,
};

use crate::{
    message::{
        DpParams,
        PrivacyParams,
        Reply,
        RequestUpdateModel,
        ResponseUpdateModel,
        UploadPayload,
    },
    save_and_restore,
    settings::PrivacySettings,
    state_machine::{
        phase::RoundContext,
        tests::utils::{
            feature_names,
            pw_params,
            ready_session,
            round_context,
            shared_state,
            trained_weights,
            weights,
            FEATURE_SIZE,
            FL_ID,
        },
        IntoPhase,
        MockIO,
        Phase,
        State,
        Upload,
    },
    unwrap_progress_continue,
    unwrap_step,
};

fn make_phase(context: RoundContext, mask: Option<FeatureMask>) -> Phase<Upload> {
    let upload = Upload::new(context, mask, weights(), trained_weights());

    // Check IntoPhase<Upload> implementation
    let mut mock = MockIO::new();
    mock.expect_notify_upload().times(1).return_const(());
    let mut phase: Phase<Upload> =
        State::new(shared_state(), Box::new(upload)).into_phase(Box::new(mock));
    phase.check_io_mock();
    phase
}

/// The trained weights of the round features, scaled by the training set size.
fn scaled_weights() -> FeatureMap {
    let trained = trained_weights();
    feature_names()
        .into_iter()
        .map(|name| {
            let values = trained[&name].iter().map(|v| v * 64.0).collect();
            (name, values)
        })
        .collect()
}

/// Compose the message, and return it along with the phase.
fn compose(phase: Phase<Upload>) -> (Phase<Upload>, RequestUpdateModel) {
    let phase = unwrap_progress_continue!(phase, compose_message);
    let message = phase.state.private.message.clone().unwrap();
    assert_eq!(message.fl_id, FL_ID);
    assert_eq!(message.fl_name, "lenet");
    assert_eq!(message.iteration, 1);
    (phase, message)
}

async fn send(mut phase: Phase<Upload>, message: RequestUpdateModel) {
    phase.with_io_mock(|mock| {
        mock.expect_update_model()
            .times(1)
            .withf(move |req| *req == message)
            .returning(|_| Ok(Reply::Message(ResponseUpdateModel::default())));
    });

    let mut phase = unwrap_step!(phase, complete, unmask);
    phase.check_io_mock();
    assert_eq!(phase.state.shared.round.status, RoundStatus::Success);
}

#[tokio::test]
async fn test_upload_plain_update() {
    let phase = make_phase(round_context(PrivacyParams::NotEncrypt), None);
    let (phase, message) = compose(phase);
    assert_eq!(message.payload, UploadPayload::Dense(scaled_weights()));
    assert!(message.unsupervised_eval_items.is_none());
    send(phase, message).await;
}

#[tokio::test]
async fn test_save_and_restore() {
    let mut phase = make_phase(round_context(PrivacyParams::NotEncrypt), None);
    phase.with_io_mock(|mock| {
        mock.expect_notify_upload().times(1).return_const(());
    });
    let phase = save_and_restore!(phase, Upload);

    let (mut phase, message) = compose(phase);
    phase.with_io_mock(|mock| {
        mock.expect_notify_upload().times(1).return_const(());
    });
    let phase = save_and_restore!(phase, Upload);
    // the composed message survives, so it is sent as is
    assert_eq!(phase.state.private.message.as_ref(), Some(&message));
    send(phase, message).await;
}

#[tokio::test]
async fn test_upload_compressed_update() {
    let mut context = round_context(PrivacyParams::NotEncrypt);
    context.compress_type = CompressType::DiffSparseQuant;
    context.sparse_rate = 0.5;
    let phase = make_phase(context, None);

    let (phase, message) = compose(phase);
    match &message.payload {
        UploadPayload::Compressed(update) => {
            assert_eq!(update.iteration, 1);
            assert_eq!(update.features.len(), 2);
        }
        payload => panic!("not a compressed update: {:?}", payload),
    }
    send(phase, message).await;
}

#[tokio::test]
async fn test_upload_masked_update() {
    let session = ready_session();
    let mask = session.double_mask().unwrap();
    let mut context = round_context(PrivacyParams::PwEncrypt(pw_params()));
    context.session = Some(session);
    let phase = make_phase(context, Some(mask.clone()));

    let (phase, message) = compose(phase);
    let trained = trained_weights();
    let mut expected = FeatureMap::new();
    expected.insert(
        "conv.weight".to_string(),
        mask_weight(64, &trained["conv.weight"], &mask, 0).unwrap(),
    );
    expected.insert(
        "fc.weight".to_string(),
        mask_weight(64, &trained["fc.weight"], &mask, 4).unwrap(),
    );
    assert_eq!(message.payload, UploadPayload::Dense(expected));
    send(phase, message).await;
}

#[tokio::test]
async fn test_missing_mask() {
    let phase = make_phase(round_context(PrivacyParams::PwEncrypt(pw_params())), None);
    let mut phase = phase;
    phase.with_io_mock(|mock| {
        mock.expect_notify_failed().times(1).return_const(());
    });

    let mut phase = unwrap_step!(phase, complete, failed);
    phase.check_io_mock();
    assert_eq!(phase.state.private.failure.code, ResponseCode::RequestError);
}

#[tokio::test]
async fn test_upload_noised_update() {
    let context = round_context(PrivacyParams::DpEncrypt(DpParams {
        eps: 100.0,
        delta: 0.01,
        norm_clip_factor: 1.0,
    }));
    let phase = make_phase(context, None);

    let (phase, message) = compose(phase);
    match &message.payload {
        UploadPayload::Dense(features) => {
            assert_eq!(features.keys().cloned().collect::<Vec<_>>(), feature_names());
            assert_eq!(features.values().map(Vec::len).sum::<usize>(), FEATURE_SIZE);
            assert!(features.values().flatten().all(|v| v.is_finite()));
        }
        payload => panic!("not a dense update: {:?}", payload),
    }
    send(phase, message).await;
}

#[tokio::test]
async fn test_upload_signds_selection() {
    let config = PrivacySettings::default().signds_config().unwrap();
    let phase = make_phase(round_context(PrivacyParams::SignDs(config)), None);

    let (phase, message) = compose(phase);
    match &message.payload {
        UploadPayload::SignDs { indices, .. } => {
            assert!(indices.iter().all(|i| (*i as usize) < FEATURE_SIZE));
        }
        payload => panic!("not a SignDS selection: {:?}", payload),
    }
    send(phase, message).await;
}

#[tokio::test]
async fn test_unsupervised_eval_items() {
    let mut context = round_context(PrivacyParams::NotEncrypt);
    context.unsupervised_eval = true;
    let mut phase = make_phase(context, None);
    phase.with_io_mock(|mock| {
        mock.expect_infer()
            .times(1)
            .returning(|| Ok(vec![0, 1, 1, 3]));
    });

    let (mut phase, message) = compose(phase);
    phase.check_io_mock();
    let items = message.unsupervised_eval_items.as_ref().unwrap();
    assert_eq!(items.len(), 4);
    send(phase, message).await;
}

#[tokio::test]
async fn test_upload_out_of_time() {
    let phase = make_phase(round_context(PrivacyParams::NotEncrypt), None);
    let (mut phase, _) = compose(phase);
    phase.with_io_mock(|mock| {
        mock.expect_update_model().times(1).returning(|_| {
            Ok(Reply::Message(ResponseUpdateModel {
                retcode: ResponseCode::OutOfTime,
                next_req_time: 4321,
                ..Default::default()
            }))
        });
    });

    let mut phase = unwrap_step!(phase, complete, start_job);
    phase.check_io_mock();

    let round = &phase.state.shared.round;
    assert_eq!(round.status, RoundStatus::Restart);
    assert_eq!(round.code, ResponseCode::OutOfTime);
    assert_eq!(round.next_request_time, Some(4321));
}

#[tokio::test]
async fn test_upload_rejected() {
    let phase = make_phase(round_context(PrivacyParams::NotEncrypt), None);
    let (mut phase, _) = compose(phase);
    phase.with_io_mock(|mock| {
        let mut seq = Sequence::new();
        mock.expect_update_model()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| {
                Ok(Reply::Message(ResponseUpdateModel {
                    retcode: ResponseCode::RequestError,
                    reason: "unknown device".to_string(),
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
    assert!(!failure.task_fatal);
    assert_eq!(failure.reason, "unknown device");
}
