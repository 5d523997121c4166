use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use fedlite_core::mask::FeatureMask;

use crate::{
    message::{RequestExchangeKeys, RequestGetKeys, RequestGetSecrets, RequestShareSecrets},
    state_machine::{
        phase::{now_ms, NotReady, RoundContext, RoundFailure},
        IntoPhase,
        Phase,
        PhaseIo,
        Progress,
        State,
        Step,
        Train,
        TransitionOutcome,
        IO,
    },
};

/// The phase in which the device sets up the pairwise masks of its update.
///
/// Without pairwise masking, there is nothing to do and the phase completes
/// right away.
#[derive(Serialize, Deserialize, Debug)]
pub struct MaskSetup {
    pub context: RoundContext,
    /// Whether the coordinator received the public keys of the device
    pub keys_sent: bool,
    /// Whether the public keys of the peers are known
    pub peers_fetched: bool,
    /// Whether the coordinator received the shares of the device secrets
    pub shares_sent: bool,
    /// Whether the shares of the peers secrets are known
    pub shares_received: bool,
    pub mask: Option<FeatureMask>,
}

impl MaskSetup {
    pub fn new(context: RoundContext) -> Self {
        Self {
            context,
            keys_sent: false,
            peers_fetched: false,
            shares_sent: false,
            shares_received: false,
            mask: None,
        }
    }

    fn has_sent_keys(&self) -> bool {
        self.keys_sent || self.has_fetched_peers()
    }

    fn has_fetched_peers(&self) -> bool {
        self.peers_fetched || self.has_sent_shares()
    }

    fn has_sent_shares(&self) -> bool {
        self.shares_sent || self.has_received_shares()
    }

    fn has_received_shares(&self) -> bool {
        self.shares_received || self.has_mask()
    }

    fn has_mask(&self) -> bool {
        self.mask.is_some()
    }
}

impl IntoPhase<MaskSetup> for State<MaskSetup> {
    fn into_phase(self, io: PhaseIo) -> Phase<MaskSetup> {
        Phase::<_>::new(self, io)
    }
}

#[async_trait]
impl Step for Phase<MaskSetup> {
    async fn step(mut self) -> TransitionOutcome {
        if self.state.private.context.session.is_none() {
            debug!("no pairwise masking in this round, continuing");
            return TransitionOutcome::Complete(self.into_train().into());
        }

        self = try_progress!(self.send_keys().await);
        self = try_progress!(self.fetch_peers().await);
        self = try_progress!(self.send_shares().await);
        self = try_progress!(self.receive_shares().await);
        self = try_progress!(self.compute_mask());

        info!("the pairwise masks are set up");
        self.succeeded();
        TransitionOutcome::Complete(self.into_train().into())
    }
}

impl Phase<MaskSetup> {
    fn fl_id(&self) -> String {
        self.state.shared.task.fl_id.clone()
    }

    fn iteration(&self) -> u64 {
        self.state.shared.round.iteration
    }

    pub(crate) async fn send_keys(mut self) -> Progress<MaskSetup> {
        if self.state.private.has_sent_keys() {
            debug!("already sent the public keys, continuing");
            return Progress::Continue(self);
        }
        // UNWRAP_SAFE: the session is checked in `step()`
        let keys = self.state.private.context.session.as_ref().unwrap().public_keys();
        let req = RequestExchangeKeys {
            fl_id: self.fl_id(),
            iteration: self.iteration(),
            keys,
            timestamp: now_ms(),
        };
        debug!("sending the public keys");
        let reply = self.io.exchange_keys(req).await;
        match self.accept("exchangeKeys", reply, NotReady::Restart) {
            Ok(_) => {
                self.state.private.keys_sent = true;
                Progress::Updated(self.into())
            }
            Err(interrupt) => self.interrupt(interrupt),
        }
    }

    pub(crate) async fn fetch_peers(mut self) -> Progress<MaskSetup> {
        if self.state.private.has_fetched_peers() {
            debug!("already fetched the public keys of the peers, continuing");
            return Progress::Continue(self);
        }
        let req = RequestGetKeys {
            fl_id: self.fl_id(),
            iteration: self.iteration(),
            timestamp: now_ms(),
        };
        debug!("fetching the public keys of the peers");
        let reply = self.io.get_keys(req).await;
        let response = match self.accept("getKeys", reply, NotReady::Wait) {
            Ok(response) => response,
            Err(interrupt) => return self.interrupt(interrupt),
        };
        // UNWRAP_SAFE: the session is checked in `step()`
        let session = self.state.private.context.session.as_mut().unwrap();
        match session.set_peers(response.keys) {
            Ok(()) => {
                info!("{} peers take part in the round", session.peers().len());
                self.state.private.peers_fetched = true;
                Progress::Updated(self.into())
            }
            Err(e) => self.fail(RoundFailure::local(e)),
        }
    }

    pub(crate) async fn send_shares(mut self) -> Progress<MaskSetup> {
        if self.state.private.has_sent_shares() {
            debug!("already sent the shares of the secrets, continuing");
            return Progress::Continue(self);
        }
        // UNWRAP_SAFE: the session is checked in `step()`
        let session = self.state.private.context.session.as_mut().unwrap();
        let shares = match session.share_secrets() {
            Ok(shares) => shares,
            Err(e) => return self.fail(RoundFailure::local(e)),
        };
        let req = RequestShareSecrets {
            fl_id: self.fl_id(),
            iteration: self.iteration(),
            shares,
            timestamp: now_ms(),
        };
        debug!("sending the shares of the secrets");
        let reply = self.io.share_secrets(req).await;
        match self.accept("shareSecrets", reply, NotReady::Restart) {
            Ok(_) => {
                self.state.private.shares_sent = true;
                Progress::Updated(self.into())
            }
            Err(interrupt) => self.interrupt(interrupt),
        }
    }

    pub(crate) async fn receive_shares(mut self) -> Progress<MaskSetup> {
        if self.state.private.has_received_shares() {
            debug!("already received the shares of the peers, continuing");
            return Progress::Continue(self);
        }
        let req = RequestGetSecrets {
            fl_id: self.fl_id(),
            iteration: self.iteration(),
            timestamp: now_ms(),
        };
        debug!("fetching the shares of the peers");
        let reply = self.io.get_secrets(req).await;
        let response = match self.accept("getSecrets", reply, NotReady::Wait) {
            Ok(response) => response,
            Err(interrupt) => return self.interrupt(interrupt),
        };
        // UNWRAP_SAFE: the session is checked in `step()`
        let session = self.state.private.context.session.as_mut().unwrap();
        match session.accept_shares(response.shares) {
            Ok(()) => {
                self.state.private.shares_received = true;
                Progress::Updated(self.into())
            }
            Err(e) => self.fail(RoundFailure::local(e)),
        }
    }

    pub(crate) fn compute_mask(mut self) -> Progress<MaskSetup> {
        if self.state.private.has_mask() {
            debug!("already computed the mask, continuing");
            return Progress::Continue(self);
        }
        // UNWRAP_SAFE: the session is checked in `step()`
        let session = self.state.private.context.session.as_ref().unwrap();
        match session.double_mask() {
            Ok(mask) => {
                debug!("computed a mask of {} values", mask.len());
                self.state.private.mask = Some(mask);
                Progress::Continue(self)
            }
            Err(e) => self.fail(RoundFailure::local(e)),
        }
    }

    fn into_train(self) -> Phase<Train> {
        let MaskSetup { context, mask, .. } = *self.state.private;
        State::new(self.state.shared, Box::new(Train::new(context, mask))).into_phase(self.io)
    }
}
