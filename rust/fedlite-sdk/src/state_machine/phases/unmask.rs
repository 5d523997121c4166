use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use fedlite_core::FlId;

use crate::{
    message::{RequestGetClientList, RequestReconstructSecrets},
    state_machine::{
        phase::{now_ms, NotReady, RoundContext, RoundFailure},
        Download,
        IntoPhase,
        Phase,
        PhaseIo,
        Progress,
        State,
        Step,
        TransitionOutcome,
        IO,
    },
};

/// The phase in which the device helps the coordinator to remove the masks
/// of the clients that dropped out.
#[derive(Serialize, Deserialize, Debug)]
pub struct Unmask {
    pub context: RoundContext,
    /// The clients whose update reached the coordinator
    pub survivors: Option<Vec<FlId>>,
}

impl Unmask {
    pub fn new(context: RoundContext) -> Self {
        Self {
            context,
            survivors: None,
        }
    }

    fn has_fetched_survivors(&self) -> bool {
        self.survivors.is_some()
    }
}

impl IntoPhase<Unmask> for State<Unmask> {
    fn into_phase(self, io: PhaseIo) -> Phase<Unmask> {
        Phase::<_>::new(self, io)
    }
}

#[async_trait]
impl Step for Phase<Unmask> {
    async fn step(mut self) -> TransitionOutcome {
        if self.state.private.context.session.is_none() {
            debug!("no pairwise masking in this round, continuing");
            return TransitionOutcome::Complete(self.into_download().into());
        }

        self = try_progress!(self.fetch_survivors().await);

        // UNWRAP_SAFE: the session is checked above and the survivors are set
        // in `self.fetch_survivors()`
        let session = self.state.private.context.session.as_ref().unwrap();
        let survivors = self.state.private.survivors.as_ref().unwrap();
        let shares = match session.reconstruction_shares(survivors) {
            Ok(shares) => shares,
            Err(e) => return self.fail(RoundFailure::local(e)).into_outcome(),
        };
        let req = RequestReconstructSecrets {
            fl_id: self.state.shared.task.fl_id.clone(),
            iteration: self.state.shared.round.iteration,
            shares,
            timestamp: now_ms(),
        };
        debug!("revealing {} shares", req.shares.len());
        let reply = self.io.reconstruct_secrets(req).await;
        match self.accept("reconstructSecrets", reply, NotReady::Restart) {
            Ok(_) => {
                info!("revealed the shares of the round");
                self.succeeded();
                TransitionOutcome::Complete(self.into_download().into())
            }
            Err(interrupt) => self.interrupt(interrupt).into_outcome(),
        }
    }
}

impl Phase<Unmask> {
    pub(crate) async fn fetch_survivors(mut self) -> Progress<Unmask> {
        if self.state.private.has_fetched_survivors() {
            debug!("already fetched the surviving clients, continuing");
            return Progress::Continue(self);
        }
        let req = RequestGetClientList {
            fl_id: self.state.shared.task.fl_id.clone(),
            iteration: self.state.shared.round.iteration,
            timestamp: now_ms(),
        };
        debug!("fetching the surviving clients");
        let reply = self.io.get_client_list(req).await;
        match self.accept("getClientList", reply, NotReady::Wait) {
            Ok(response) => {
                info!("{} clients uploaded their update", response.clients.len());
                self.state.private.survivors = Some(response.clients);
                Progress::Updated(self.into())
            }
            Err(interrupt) => self.interrupt(interrupt),
        }
    }

    fn into_download(self) -> Phase<Download> {
        let Unmask { context, .. } = *self.state.private;
        State::new(self.state.shared, Box::new(Download::new(context))).into_phase(self.io)
    }
}
