use fedlite_core::{
    secagg::{CipherSession, ClientKeys, EncryptedShare, PwConfig},
    CompressType,
    FeatureMap,
    ServerMode,
};

use crate::{
    message::{Plan, PrivacyParams, PwParams},
    settings::{PrivacySettings, TaskSettings},
    state_machine::{phase::RoundContext, SharedState},
};

#[macro_export]
macro_rules! unwrap_as {
    ($e:expr, $p:path) => {
        match $e {
            $p(s) => s,
            x => panic!("Not a {}: {:?}", stringify!($p), x),
        }
    };
}

#[macro_export]
macro_rules! unwrap_step {
    ($phase:expr, complete, $state_machine:tt) => {
        unwrap_step!(
            $phase,
            $crate::state_machine::TransitionOutcome::Complete,
            $state_machine
        )
    };
    ($phase:expr, pending, $state_machine:tt) => {
        unwrap_step!(
            $phase,
            $crate::state_machine::TransitionOutcome::Pending,
            $state_machine
        )
    };
    ($phase:expr, $transition_outcome:path, start_job) => {
        unwrap_step!(
            $phase,
            $transition_outcome,
            $crate::state_machine::StateMachine::StartJob
        )
    };
    ($phase:expr, $transition_outcome:path, mask_setup) => {
        unwrap_step!(
            $phase,
            $transition_outcome,
            $crate::state_machine::StateMachine::MaskSetup
        )
    };
    ($phase:expr, $transition_outcome:path, train) => {
        unwrap_step!(
            $phase,
            $transition_outcome,
            $crate::state_machine::StateMachine::Train
        )
    };
    ($phase:expr, $transition_outcome:path, upload) => {
        unwrap_step!(
            $phase,
            $transition_outcome,
            $crate::state_machine::StateMachine::Upload
        )
    };
    ($phase:expr, $transition_outcome:path, unmask) => {
        unwrap_step!(
            $phase,
            $transition_outcome,
            $crate::state_machine::StateMachine::Unmask
        )
    };
    ($phase:expr, $transition_outcome:path, download) => {
        unwrap_step!(
            $phase,
            $transition_outcome,
            $crate::state_machine::StateMachine::Download
        )
    };
    ($phase:expr, $transition_outcome:path, evaluate) => {
        unwrap_step!(
            $phase,
            $transition_outcome,
            $crate::state_machine::StateMachine::Evaluate
        )
    };
    ($phase:expr, $transition_outcome:path, done) => {
        unwrap_step!(
            $phase,
            $transition_outcome,
            $crate::state_machine::StateMachine::Done
        )
    };
    ($phase:expr, $transition_outcome:path, failed) => {
        unwrap_step!(
            $phase,
            $transition_outcome,
            $crate::state_machine::StateMachine::Failed
        )
    };
    ($phase:expr, $transition_outcome:path, $state_machine:path) => {{
        let x = $crate::unwrap_as!(
            $crate::state_machine::Step::step($phase).await,
            $transition_outcome
        );
        $crate::unwrap_as!(x, $state_machine)
    }};
}

#[macro_export]
macro_rules! unwrap_progress_continue {
    ($expr:expr) => {
        $crate::unwrap_as!($expr, $crate::state_machine::Progress::Continue)
    };
    ($phase:expr, $method:tt) => {
        unwrap_progress_continue!($phase.$method())
    };
    ($phase:expr, $method:tt, async) => {
        unwrap_progress_continue!($phase.$method().await)
    };
}

/// Save the phase, serialize and deserialize it, and restore it with the
/// same io mock.
#[macro_export]
macro_rules! save_and_restore {
    ($phase:expr, $state:tt) => {{
        let mut phase = $phase;
        let io_mock = std::mem::replace(
            &mut phase.io,
            Box::new($crate::state_machine::MockIO::new()),
        );
        let serializable_state = Into::<$crate::state_machine::SerializableState>::into(phase);
        let bytes = bincode::serialize(&serializable_state).unwrap();
        let serializable_state: $crate::state_machine::SerializableState =
            bincode::deserialize(&bytes).unwrap();
        let state = $crate::unwrap_as!(
            serializable_state,
            $crate::state_machine::SerializableState::$state
        );
        let mut phase = $crate::state_machine::IntoPhase::<$state>::into_phase(state, io_mock);
        phase.check_io_mock();
        phase
    }};
}

pub const FL_ID: &str = "device-0";

pub fn task_settings() -> TaskSettings {
    TaskSettings::new(FL_ID, "lenet", 64)
}

pub fn shared_state() -> Box<SharedState> {
    let mut shared = SharedState::new(task_settings(), PrivacySettings::default()).unwrap();
    shared.round.iteration = 1;
    shared.round.iterations = 3;
    Box::new(shared)
}

/// The names of the features updated in a round.
pub fn feature_names() -> Vec<String> {
    vec!["conv.weight".to_string(), "fc.weight".to_string()]
}

/// The number of values of the updated features.
pub const FEATURE_SIZE: usize = 6;

/// The weights of the model before training.
pub fn weights() -> FeatureMap {
    let mut weights = FeatureMap::new();
    weights.insert("conv.weight".to_string(), vec![0.1, 0.2, 0.3, 0.4]);
    weights.insert("fc.weight".to_string(), vec![0.5, -0.6]);
    weights.insert("fc.bias".to_string(), vec![0.0]);
    weights
}

/// The weights of the model after training.
pub fn trained_weights() -> FeatureMap {
    weights()
        .into_iter()
        .map(|(name, values)| (name, values.into_iter().map(|v| v + 0.25).collect()))
        .collect()
}

pub fn plan(privacy: PrivacyParams) -> Plan {
    Plan {
        fl_name: "lenet".to_string(),
        iterations: 3,
        epochs: 1,
        batch_size: 32,
        learning_rate: 0.01,
        server_mode: ServerMode::FederatedLearning,
        privacy,
    }
}

pub fn round_context(privacy: PrivacyParams) -> RoundContext {
    RoundContext {
        plan: plan(privacy),
        feature_names: feature_names(),
        feature_size: FEATURE_SIZE,
        compress_type: CompressType::NoCompress,
        sparse_rate: 0.0,
        unsupervised_eval: false,
        session: None,
    }
}

/// Big endian bytes of 2^255 - 19.
pub fn prime_bytes() -> Vec<u8> {
    let mut prime = vec![0x7f];
    prime.extend(std::iter::repeat(0xff).take(30));
    prime.push(0xed);
    prime
}

pub fn pw_params() -> PwParams {
    PwParams {
        threshold: 2,
        prime: prime_bytes(),
    }
}

/// A round context with a fresh secure aggregation session for the device.
pub fn pw_round_context() -> RoundContext {
    let mut context = round_context(PrivacyParams::PwEncrypt(pw_params()));
    context.session = Some(session(FL_ID));
    context
}

pub fn session(fl_id: &str) -> CipherSession {
    let config = PwConfig::new(2, &prime_bytes(), FEATURE_SIZE).unwrap();
    CipherSession::new(fl_id.to_string(), 1, config).unwrap()
}

/// The peers of the device in a pairwise masked round.
pub fn peers() -> Vec<CipherSession> {
    vec![session("device-1"), session("device-2")]
}

/// Let the peers exchange their keys with the device, and return the shares
/// they send to the device.
pub fn peer_shares(peers: &mut [CipherSession], keys: &[ClientKeys]) -> Vec<EncryptedShare> {
    let mut shares = Vec::new();
    for peer in peers.iter_mut() {
        peer.set_peers(keys.to_vec()).unwrap();
        shares.extend(
            peer.share_secrets()
                .unwrap()
                .into_iter()
                .filter(|share| share.recipient == FL_ID),
        );
    }
    shares
}

/// Run the whole key exchange between the device and its peers, and return
/// the session of the device.
pub fn ready_session() -> CipherSession {
    let mut device = session(FL_ID);
    let mut peers = peers();
    let keys: Vec<ClientKeys> = std::iter::once(device.public_keys())
        .chain(peers.iter().map(CipherSession::public_keys))
        .collect();
    device.set_peers(keys.clone()).unwrap();
    device.share_secrets().unwrap();
    let shares = peer_shares(&mut peers, &keys);
    device.accept_shares(shares).unwrap();
    device
}
