use mockall::{predicate::eq, Sequence};

use fedlite_core::{ResponseCode, RoundStatus, ServerMode};

use crate::{
    message::{PrivacyParams, Reply, ResponseGetModel, ResponseGetResult},
    runtime::ModelTarget,
    save_and_restore,
    state_machine::{
        phase::RoundContext,
        tests::utils::{round_context, shared_state, trained_weights},
        Download,
        IntoPhase,
        MockIO,
        Phase,
        SharedState,
        State,
    },
    unwrap_progress_continue,
    unwrap_step,
};

fn make_phase_with(shared: Box<SharedState>, context: RoundContext) -> Phase<Download> {
    // Check IntoPhase<Download> implementation: no notification
    let mock = MockIO::new();
    let mut phase: Phase<Download> =
        State::new(shared, Box::new(Download::new(context))).into_phase(Box::new(mock));
    phase.check_io_mock();
    phase
}

fn make_phase() -> Phase<Download> {
    make_phase_with(shared_state(), round_context(PrivacyParams::NotEncrypt))
}

fn model() -> ResponseGetModel {
    ResponseGetModel {
        iteration: 1,
        feature_map: trained_weights(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_download_then_evaluate() {
    let mut phase = make_phase();
    phase.with_io_mock(|mock| {
        let mut seq = Sequence::new();
        // the coordinator is still aggregating
        mock.expect_get_model()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| {
                Ok(Reply::Message(ResponseGetModel {
                    retcode: ResponseCode::SucNotReady,
                    ..Default::default()
                }))
            });
        mock.expect_get_model()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|req| req.fl_name == "lenet" && req.iteration == 1)
            .returning(|_| Ok(Reply::Message(model())));
        mock.expect_update_features()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|target, features| *target == ModelTarget::Train && *features == trained_weights())
            .returning(|_, _| Ok(()));
    });

    let phase = unwrap_step!(phase, pending, download);
    assert_eq!(phase.state.shared.round.status, RoundStatus::Wait);

    let mut phase = unwrap_step!(phase, complete, evaluate);
    phase.check_io_mock();
    assert_eq!(phase.state.shared.round.status, RoundStatus::Success);
}

#[tokio::test]
async fn test_download_without_evaluation() {
    let mut shared = shared_state();
    shared.task.evaluate = false;
    let mut context = round_context(PrivacyParams::NotEncrypt);
    context.plan.server_mode = ServerMode::HybridTraining;
    let mut phase = make_phase_with(shared, context);
    phase.with_io_mock(|mock| {
        let mut seq = Sequence::new();
        mock.expect_get_model()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(Reply::Message(model())));
        // both models are updated under hybrid training
        mock.expect_update_features()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|target, _| *target == ModelTarget::Train)
            .returning(|_, _| Ok(()));
        mock.expect_update_features()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|target, _| *target == ModelTarget::Infer)
            .returning(|_, _| Ok(()));
        mock.expect_notify_done()
            .times(1)
            .in_sequence(&mut seq)
            .with(eq(1))
            .return_const(());
    });

    let mut phase = unwrap_step!(phase, complete, done);
    phase.check_io_mock();
    assert_eq!(phase.state.private.iteration, 1);
}

async fn step1_poll_result(mut phase: Phase<Download>) -> Phase<Download> {
    phase.with_io_mock(|mock| {
        let mut seq = Sequence::new();
        mock.expect_get_result()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(Reply::NotReady));
        mock.expect_get_result()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(Reply::Message(ResponseGetResult::default())));
    });

    let phase = unwrap_step!(phase, pending, download);
    assert!(!phase.state.private.result_ready);
    let phase = unwrap_step!(phase, complete, download);
    assert!(phase.state.private.result_ready);

    let mut phase = unwrap_progress_continue!(phase, poll_result, async);
    phase.check_io_mock();
    phase
}

#[tokio::test]
async fn test_poll_result() {
    let mut shared = shared_state();
    shared.task.poll_result = true;
    let phase = make_phase_with(shared, round_context(PrivacyParams::NotEncrypt));
    let phase = step1_poll_result(phase).await;
    let mut phase = save_and_restore!(phase, Download);
    assert!(phase.state.private.result_ready);

    phase.with_io_mock(|mock| {
        mock.expect_get_model()
            .times(1)
            .returning(|_| Ok(Reply::Message(model())));
        mock.expect_update_features()
            .times(1)
            .returning(|_, _| Ok(()));
    });
    let mut phase = unwrap_step!(phase, complete, evaluate);
    phase.check_io_mock();
}

#[tokio::test]
async fn test_update_features_error() {
    let mut phase = make_phase();
    phase.with_io_mock(|mock| {
        let mut seq = Sequence::new();
        mock.expect_get_model()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(Reply::Message(model())));
        mock.expect_update_features()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Err("shape mismatch".into()));
        mock.expect_notify_failed()
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());
    });

    let mut phase = unwrap_step!(phase, complete, failed);
    phase.check_io_mock();
    assert!(phase.state.private.failure.reason.contains("shape mismatch"));
}

#[tokio::test]
async fn test_job_not_available() {
    let mut phase = make_phase();
    phase.with_io_mock(|mock| {
        mock.expect_get_model()
            .times(1)
            .returning(|_| Ok(Reply::JobNotAvailable));
        mock.expect_notify_failed().times(1).return_const(());
    });

    let mut phase = unwrap_step!(phase, complete, failed);
    phase.check_io_mock();
    assert!(phase.state.private.failure.task_fatal);
}
