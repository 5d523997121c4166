use mockall::{
    predicate::{always, eq},
    Sequence,
};

use fedlite_core::{ResponseCode, RoundStatus};

use crate::{
    message::{DpParams, PrivacyParams},
    runtime::ModelTarget,
    state_machine::{
        phase::RoundContext,
        tests::utils::{round_context, shared_state, trained_weights, weights},
        IntoPhase,
        MockIO,
        Phase,
        State,
        Train,
    },
    unwrap_step,
};

fn make_phase(context: RoundContext) -> Phase<Train> {
    // Check IntoPhase<Train> implementation
    let mut mock = MockIO::new();
    mock.expect_notify_train().times(1).return_const(());
    let mut phase: Phase<Train> =
        State::new(shared_state(), Box::new(Train::new(context, None))).into_phase(Box::new(mock));
    phase.check_io_mock();
    phase
}

fn dp_params() -> PrivacyParams {
    PrivacyParams::DpEncrypt(DpParams {
        eps: 100.0,
        delta: 0.01,
        norm_clip_factor: 1.0,
    })
}

#[tokio::test]
async fn test_train_phase() {
    let mut phase = make_phase(round_context(PrivacyParams::NotEncrypt));
    phase.with_io_mock(|mock| {
        let mut seq = Sequence::new();
        mock.expect_features()
            .times(1)
            .in_sequence(&mut seq)
            .with(eq(ModelTarget::Train), always())
            .returning(|_, _| Ok(weights()));
        mock.expect_backup()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(()));
        mock.expect_train()
            .times(1)
            .in_sequence(&mut seq)
            .with(eq(1), eq(0.01))
            .returning(|_, _| Ok(0.42));
        mock.expect_features()
            .times(1)
            .in_sequence(&mut seq)
            .with(eq(ModelTarget::Train), always())
            .returning(|_, _| Ok(trained_weights()));
        mock.expect_notify_upload()
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());
    });

    let mut phase = unwrap_step!(phase, complete, upload);
    phase.check_io_mock();

    assert_eq!(phase.state.private.pre, weights());
    assert_eq!(phase.state.private.post, trained_weights());
    assert!(phase.state.private.message.is_none());
    assert_eq!(phase.state.shared.round.status, RoundStatus::Success);
}

#[tokio::test]
async fn test_task_learning_rate() {
    let mut context = round_context(PrivacyParams::NotEncrypt);
    context.plan.learning_rate = 0.0;
    let mut phase = make_phase(context);
    let learning_rate = phase.state.shared.task.learning_rate;
    phase.with_io_mock(|mock| {
        mock.expect_features().returning(|_, _| Ok(weights()));
        mock.expect_backup().returning(|| Ok(()));
        mock.expect_train()
            .times(1)
            .with(eq(1), eq(learning_rate))
            .returning(|_, _| Ok(0.42));
        mock.expect_notify_upload().return_const(());
    });

    let mut phase = unwrap_step!(phase, complete, upload);
    phase.check_io_mock();
}

#[tokio::test]
async fn test_invalid_loss() {
    let mut phase = make_phase(round_context(PrivacyParams::NotEncrypt));
    phase.with_io_mock(|mock| {
        let mut seq = Sequence::new();
        mock.expect_features()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(weights()));
        mock.expect_backup()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(()));
        mock.expect_train()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(f32::NAN));
        // the weights before training are restored
        mock.expect_restore()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(()));
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

#[tokio::test]
async fn test_training_error() {
    let mut phase = make_phase(round_context(PrivacyParams::NotEncrypt));
    phase.with_io_mock(|mock| {
        mock.expect_features().times(1).returning(|_, _| Ok(weights()));
        mock.expect_backup().times(1).returning(|| Ok(()));
        mock.expect_train()
            .times(1)
            .returning(|_, _| Err("out of memory".into()));
        mock.expect_notify_failed().times(1).return_const(());
    });

    let mut phase = unwrap_step!(phase, complete, failed);
    phase.check_io_mock();
    assert!(phase.state.private.failure.reason.contains("out of memory"));
}

#[tokio::test]
async fn test_dp_clip_bound_adapts() {
    let mut phase = make_phase(round_context(dp_params()));
    assert!(phase.state.shared.dp_clip.bound().is_none());
    phase.with_io_mock(|mock| {
        let mut seq = Sequence::new();
        mock.expect_features()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(weights()));
        mock.expect_backup()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(()));
        mock.expect_train()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(0.42));
        mock.expect_features()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(trained_weights()));
        mock.expect_notify_upload()
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());
    });

    let mut phase = unwrap_step!(phase, complete, upload);
    phase.check_io_mock();

    let bound = phase.state.shared.dp_clip.bound().unwrap();
    assert!(bound > 0.0);
}
