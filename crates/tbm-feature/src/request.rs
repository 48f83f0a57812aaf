//! Feature request state machine and output/input bookkeeping

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use tbm_core::{
    SeqId, TargetBufferHandle, TargetBufferLease, TargetBufferManager, TargetId, TargetPayload,
    TargetStatus,
};

use crate::{FeatureError, Result};

/// Processing state of one feature request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestState {
    Initialized,
    /// Posted and waiting to be executed
    ReadyToExecute,
    Executing,
    /// Waiting on input from an earlier sequence or an upstream feature
    InputResourcePending,
    /// Inputs satisfied, execution scheduled
    InputResourcePendingScheduled,
    /// Waiting on outputs of this feature
    OutputResourcePending,
    OutputErrorResourcePending,
    /// Outputs produced, waiting on the downstream feature
    OutputNotificationPending,
    OutputErrorNotificationPending,
    Complete,
    /// Torn down
    Invalid,
}

const STATE_COUNT: usize = 11;

const F: bool = false;
const T: bool = true;

/// Allowed transitions, rows are the current state
#[rustfmt::skip]
const TRANSITIONS: [[bool; STATE_COUNT]; STATE_COUNT] = [
    // Init RTE EXE IRP IRPS ORP OERP ONP OENP COM INV
    [F,   T,  F,  F,  F,   F,  F,   F,  T,   F,  T], // Initialized
    [F,   F,  T,  F,  F,   F,  F,   F,  T,   F,  T], // ReadyToExecute
    [F,   T,  F,  T,  F,   T,  F,   T,  T,   F,  T], // Executing
    [F,   F,  F,  F,  T,   F,  F,   F,  T,   F,  T], // InputResourcePending
    [F,   T,  F,  F,  F,   F,  T,   F,  T,   F,  T], // InputResourcePendingScheduled
    [F,   F,  F,  F,  F,   F,  T,   T,  T,   F,  T], // OutputResourcePending
    [F,   F,  F,  F,  F,   F,  F,   T,  T,   F,  T], // OutputErrorResourcePending
    [F,   F,  T,  F,  F,   F,  F,   F,  T,   T,  T], // OutputNotificationPending
    [T,   T,  T,  T,  T,   T,  F,   T,  T,   T,  T], // OutputErrorNotificationPending
    [F,   F,  F,  F,  F,   F,  F,   F,  T,   F,  T], // Complete
    [T,   T,  T,  T,  T,   T,  F,   T,  T,   T,  T], // Invalid
];

impl RequestState {
    pub const ALL: [RequestState; STATE_COUNT] = [
        RequestState::Initialized,
        RequestState::ReadyToExecute,
        RequestState::Executing,
        RequestState::InputResourcePending,
        RequestState::InputResourcePendingScheduled,
        RequestState::OutputResourcePending,
        RequestState::OutputErrorResourcePending,
        RequestState::OutputNotificationPending,
        RequestState::OutputErrorNotificationPending,
        RequestState::Complete,
        RequestState::Invalid,
    ];

    const fn index(self) -> usize {
        self as usize
    }

    pub const fn can_transition_to(self, to: RequestState) -> bool {
        TRANSITIONS[self.index()][to.index()]
    }
}

/// One output port of a feature and the manager it produces into
#[derive(Debug, Clone)]
pub struct OutputPort {
    pub port_id: u32,
    pub tbm: TargetBufferManager,
    pub target_id: TargetId,
}

struct RequestInner {
    state: RequestState,
    /// Setup handle per output port, in port order
    outputs: Vec<Option<TargetBufferHandle>>,
    statuses: Vec<TargetStatus>,
    /// Leases on upstream records this request reads from
    inputs: Vec<TargetBufferLease>,
}

/// Request of one feature for one sequence id.
///
/// Output ports sharing a manager share its record. Input leases are held
/// until [`release_inputs`](Self::release_inputs) or until the request is
/// dropped.
pub struct FeatureRequest {
    feature: String,
    seq_id: SeqId,
    ports: Vec<OutputPort>,
    inner: Mutex<RequestInner>,
}

impl FeatureRequest {
    pub fn new(feature: &str, seq_id: SeqId, ports: Vec<OutputPort>) -> Self {
        let n = ports.len();
        Self {
            feature: feature.to_string(),
            seq_id,
            ports,
            inner: Mutex::new(RequestInner {
                state: RequestState::Initialized,
                outputs: vec![None; n],
                statuses: vec![TargetStatus::NotReady; n],
                inputs: Vec::new(),
            }),
        }
    }

    pub fn feature(&self) -> &str {
        &self.feature
    }

    pub fn seq_id(&self) -> SeqId {
        self.seq_id
    }

    pub fn output_ports(&self) -> &[OutputPort] {
        &self.ports
    }

    pub fn state(&self) -> RequestState {
        self.inner.lock().state
    }

    /// Move to `to`; setting the current state again is a no-op
    pub fn set_state(&self, to: RequestState) -> Result<()> {
        let mut inner = self.inner.lock();
        self.transition(&mut inner, to)
    }

    fn transition(&self, inner: &mut RequestInner, to: RequestState) -> Result<()> {
        let from = inner.state;
        if from == to {
            return Ok(());
        }
        if !from.can_transition_to(to) {
            warn!(feature = %self.feature, seq_id = self.seq_id, ?from, ?to, "state transition not permitted");
            return Err(FeatureError::InvalidTransition { from, to });
        }
        if to != RequestState::Invalid {
            info!(feature = %self.feature, seq_id = self.seq_id, ?from, ?to, "request state");
        }
        inner.state = to;
        Ok(())
    }

    fn port_index(&self, port_id: u32) -> Result<usize> {
        self.ports
            .iter()
            .position(|p| p.port_id == port_id)
            .ok_or(FeatureError::InvalidPort(port_id))
    }

    /// Set up a record for this sequence id on every output manager.
    ///
    /// On failure the records set up so far are removed again. Outputs can
    /// be set up once per request.
    pub fn setup_outputs(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.outputs.iter().any(Option::is_some) {
            warn!(feature = %self.feature, seq_id = self.seq_id, "outputs already set up");
            return Err(FeatureError::Core(tbm_core::Error::Failed(format!(
                "outputs of seqId {} already set up",
                self.seq_id
            ))));
        }
        for idx in 0..self.ports.len() {
            let port = &self.ports[idx];
            let shared = (0..idx).find(|&j| self.ports[j].tbm.same_manager(&port.tbm));
            let handle = match shared {
                Some(j) => inner.outputs[j].clone(),
                None => match port.tbm.setup_target_buffer(self.seq_id) {
                    Ok(handle) => Some(handle),
                    Err(e) => {
                        warn!(
                            feature = %self.feature,
                            seq_id = self.seq_id,
                            port = port.port_id,
                            error = %e,
                            "output setup failed"
                        );
                        self.rollback_outputs(&mut inner, idx);
                        return Err(e.into());
                    }
                },
            };
            inner.outputs[idx] = handle;
        }
        debug!(feature = %self.feature, seq_id = self.seq_id, ports = self.ports.len(), "outputs set up");
        Ok(())
    }

    fn rollback_outputs(&self, inner: &mut RequestInner, upto: usize) {
        for idx in 0..upto {
            let port = &self.ports[idx];
            let first = (0..idx).all(|j| !self.ports[j].tbm.same_manager(&port.tbm));
            if first && inner.outputs[idx].is_some() {
                if let Err(e) = port.tbm.remove_target_buffer(self.seq_id) {
                    warn!(feature = %self.feature, seq_id = self.seq_id, error = %e, "rollback failed");
                }
            }
        }
        inner.outputs[..upto].iter_mut().for_each(|h| *h = None);
    }

    /// Payload to produce into for `port_id`
    pub fn output(&self, port_id: u32) -> Result<TargetPayload> {
        let idx = self.port_index(port_id)?;
        let handle = self.inner.lock().outputs[idx].clone();
        let port = &self.ports[idx];
        handle
            .and_then(|h| port.tbm.get_target(&h, port.target_id))
            .ok_or(FeatureError::Core(tbm_core::Error::NoSuch(self.seq_id)))
    }

    /// Report the result of one output port.
    ///
    /// Returns true once every port has reported; the request then moves to
    /// output notification pending (or its error variant) if permitted.
    pub fn complete_output(&self, port_id: u32, status: TargetStatus) -> Result<bool> {
        let idx = self.port_index(port_id)?;
        let port = &self.ports[idx];
        let handle = self.inner.lock().outputs[idx]
            .clone()
            .ok_or(FeatureError::Core(tbm_core::Error::NoSuch(self.seq_id)))?;

        let payload = port.tbm.get_target(&handle, port.target_id);
        port.tbm
            .update_target(self.seq_id, port.target_id, payload.as_ref(), status, false)?;

        let mut inner = self.inner.lock();
        inner.statuses[idx] = status;
        let done = TargetStatus::aggregate(inner.statuses.iter().copied());
        let next = match done {
            TargetStatus::NotReady => return Ok(false),
            TargetStatus::Ready => RequestState::OutputNotificationPending,
            TargetStatus::Error => RequestState::OutputErrorNotificationPending,
        };
        if inner.state.can_transition_to(next) {
            self.transition(&mut inner, next)?;
        }
        Ok(true)
    }

    /// Hold a lease on an upstream record until inputs are released
    pub fn add_input(&self, lease: TargetBufferLease) {
        self.inner.lock().inputs.push(lease);
    }

    pub fn input_count(&self) -> usize {
        self.inner.lock().inputs.len()
    }

    /// Payload of `target_id` in the `index`th input
    pub fn input_target(&self, index: usize, target_id: TargetId) -> Option<TargetPayload> {
        let handle = self.inner.lock().inputs.get(index)?.handle().clone();
        handle.target(target_id)
    }

    /// Release every input lease, reporting the first failure
    pub fn release_inputs(&self) -> Result<()> {
        let inputs = std::mem::take(&mut self.inner.lock().inputs);
        let mut first_err = None;
        for lease in inputs {
            let seq_id = lease.seq_id();
            if let Err(e) = lease.release() {
                warn!(feature = %self.feature, seq_id, error = %e, "input release failed");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Release inputs and mark the request complete
    pub fn complete(&self) -> Result<()> {
        self.release_inputs()?;
        self.set_state(RequestState::Complete)
    }
}

impl std::fmt::Debug for FeatureRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("FeatureRequest")
            .field("feature", &self.feature)
            .field("seq_id", &self.seq_id)
            .field("state", &inner.state)
            .field("inputs", &inner.inputs.len())
            .finish()
    }
}
