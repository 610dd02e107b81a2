//! Weighted circuit breaker.
//!
//! When calls to an endpoint group fail with enough accumulated weight, the
//! circuit opens and new admissions are denied until a cooldown passes. A
//! bounded number of half-open probes then decide whether to close again.
//!
//! All state lives behind one mutex that is only held for the duration of a
//! synchronous `admit`/`record` call, never across an await point.

use forkwatch_core::{BreakerProfile, FailureKind, FailureWeights};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Source of monotonic time for the breaker.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Clock that follows tokio's timer, so paused-time tests drive cooldowns.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }
}

/// A family of endpoints sharing one circuit (e.g. `"repos"`, `"commits"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointGroup(String);

impl EndpointGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for EndpointGroup {
    fn default() -> Self {
        Self("default".to_string())
    }
}

impl From<&str> for EndpointGroup {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for EndpointGroup {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl fmt::Display for EndpointGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// State of a circuit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CircuitState {
    /// Normal operation
    Closed { accumulated_weight: f64 },

    /// Circuit is open, new calls are denied
    Open { opened_at: Instant },

    /// Testing if the API has recovered
    HalfOpen {
        probes_issued: u32,
        probes_succeeded: u32,
    },
}

impl CircuitState {
    pub fn kind(&self) -> StateKind {
        match self {
            CircuitState::Closed { .. } => StateKind::Closed,
            CircuitState::Open { .. } => StateKind::Open,
            CircuitState::HalfOpen { .. } => StateKind::HalfOpen,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, CircuitState::Closed { .. })
    }

    fn weight(&self) -> f64 {
        match self {
            CircuitState::Closed { accumulated_weight } => *accumulated_weight,
            _ => 0.0,
        }
    }
}

impl Default for CircuitState {
    fn default() -> Self {
        CircuitState::Closed {
            accumulated_weight: 0.0,
        }
    }
}

/// Data-free view of [`CircuitState`], for logs and observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateKind {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for StateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StateKind::Closed => "closed",
            StateKind::Open => "open",
            StateKind::HalfOpen => "half_open",
        })
    }
}

/// A state change of one circuit.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub group: EndpointGroup,
    pub from: StateKind,
    pub to: StateKind,

    /// Weight that drove the change: the closed total when opening, the
    /// failing probe's weight when reopening, zero otherwise.
    pub accumulated_weight: f64,

    pub at: Instant,
}

/// Callback invoked after every transition, outside the breaker lock.
pub type TransitionListener = Arc<dyn Fn(&Transition) + Send + Sync>;

type Circuits = Mutex<HashMap<EndpointGroup, Circuit>>;

/// Proof of admission. Must be handed back to `record_*`.
///
/// A probe permit dropped without being recorded (its call was cancelled or
/// aborted) hands its half-open slot back.
#[derive(Debug)]
pub struct Permit {
    group: EndpointGroup,
    generation: u64,
    probe: bool,
    resolved: AtomicBool,
    circuits: Weak<Circuits>,
}

impl Permit {
    pub fn group(&self) -> &EndpointGroup {
        &self.group
    }

    /// Whether this admission is a half-open probe.
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    /// Mark as recorded. Returns false if it already was.
    fn mark_resolved(&self) -> bool {
        !self.resolved.swap(true, Ordering::AcqRel)
    }
}

impl PartialEq for Permit {
    fn eq(&self, other: &Self) -> bool {
        self.group == other.group
            && self.generation == other.generation
            && self.probe == other.probe
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if !self.probe || *self.resolved.get_mut() {
            return;
        }
        let Some(circuits) = self.circuits.upgrade() else {
            return;
        };
        let mut circuits = circuits.lock();
        if let Some(circuit) = circuits.get_mut(&self.group) {
            if circuit.release_probe(self.generation) {
                tracing::debug!(group = %self.group, "Unrecorded probe released its slot");
            }
        }
    }
}

/// Result of asking the breaker for permission.
#[derive(Debug, PartialEq)]
pub enum Admission {
    Admitted(Permit),

    /// `retry_in` is the remaining cooldown when the circuit is open, `None`
    /// when half-open probes are exhausted.
    Denied { retry_in: Option<Duration> },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted(_))
    }
}

#[derive(Debug, Default)]
struct Circuit {
    state: CircuitState,

    /// Bumped on every transition; permits from an older generation are stale.
    generation: u64,

    times_opened: u64,
}

impl Circuit {
    fn transition(
        &mut self,
        group: &EndpointGroup,
        to: CircuitState,
        weight: f64,
        at: Instant,
    ) -> Transition {
        let from = self.state.kind();
        self.state = to;
        self.generation += 1;
        if to.kind() == StateKind::Open {
            self.times_opened += 1;
        }
        Transition {
            group: group.clone(),
            from,
            to: to.kind(),
            accumulated_weight: weight,
            at,
        }
    }

    /// Give back the slot of a probe that will never be recorded.
    fn release_probe(&mut self, generation: u64) -> bool {
        match self.state {
            CircuitState::HalfOpen {
                probes_issued,
                probes_succeeded,
            } if generation == self.generation && probes_issued > 0 => {
                self.state = CircuitState::HalfOpen {
                    probes_issued: probes_issued - 1,
                    probes_succeeded,
                };
                true
            }
            _ => false,
        }
    }
}

/// Circuit breaker with weighted failure accounting.
///
/// Each endpoint group has its own circuit to allow independent recovery.
pub struct CircuitBreaker {
    circuits: Arc<Circuits>,
    profile: BreakerProfile,
    weights: FailureWeights,
    clock: Arc<dyn Clock>,
    listener: Option<TransitionListener>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("profile", &self.profile)
            .field("weights", &self.weights)
            .finish()
    }
}

impl CircuitBreaker {
    /// Create a new circuit breaker driven by tokio time.
    pub fn new(profile: BreakerProfile, weights: FailureWeights) -> Self {
        Self {
            circuits: Arc::new(Mutex::new(HashMap::new())),
            profile,
            weights,
            clock: Arc::new(TokioClock),
            listener: None,
        }
    }

    /// Replace the clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Register a transition listener.
    pub fn with_listener(mut self, listener: TransitionListener) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn profile(&self) -> &BreakerProfile {
        &self.profile
    }

    fn permit(&self, circuit: &Circuit, group: &EndpointGroup, probe: bool) -> Permit {
        Permit {
            group: group.clone(),
            generation: circuit.generation,
            probe,
            resolved: AtomicBool::new(false),
            circuits: Arc::downgrade(&self.circuits),
        }
    }

    /// Ask permission to call an endpoint in `group`.
    pub fn admit(&self, group: &EndpointGroup) -> Admission {
        let now = self.clock.now();
        let (admission, transition) = {
            let mut circuits = self.circuits.lock();
            let circuit = circuits.entry(group.clone()).or_default();

            match circuit.state {
                CircuitState::Closed { .. } => {
                    (Admission::Admitted(self.permit(circuit, group, false)), None)
                }
                CircuitState::Open { opened_at } => {
                    let elapsed = now.saturating_duration_since(opened_at);
                    if elapsed >= self.profile.half_open_after {
                        let transition = circuit.transition(
                            group,
                            CircuitState::HalfOpen {
                                probes_issued: 1,
                                probes_succeeded: 0,
                            },
                            0.0,
                            now,
                        );
                        (
                            Admission::Admitted(self.permit(circuit, group, true)),
                            Some(transition),
                        )
                    } else {
                        (
                            Admission::Denied {
                                retry_in: Some(self.profile.half_open_after - elapsed),
                            },
                            None,
                        )
                    }
                }
                CircuitState::HalfOpen {
                    probes_issued,
                    probes_succeeded,
                } => {
                    if probes_issued < self.profile.half_open_probe_count {
                        circuit.state = CircuitState::HalfOpen {
                            probes_issued: probes_issued + 1,
                            probes_succeeded,
                        };
                        (Admission::Admitted(self.permit(circuit, group, true)), None)
                    } else {
                        (Admission::Denied { retry_in: None }, None)
                    }
                }
            }
        };

        if let Some(transition) = transition {
            self.notify(&transition);
        }
        admission
    }

    /// Record a successful call.
    pub fn record_success(&self, permit: &Permit) {
        self.resolve(permit, None);
    }

    /// Record the terminal failure of a call.
    pub fn record_failure(&self, permit: &Permit, kind: FailureKind) {
        self.resolve(permit, Some(kind));
    }

    fn resolve(&self, permit: &Permit, failure: Option<FailureKind>) {
        if !permit.mark_resolved() {
            return;
        }
        let weight = failure.map_or(0.0, |kind| self.weights.weight(kind));
        let now = self.clock.now();

        let transition = {
            let mut circuits = self.circuits.lock();
            let Some(circuit) = circuits.get_mut(&permit.group) else {
                return;
            };

            match circuit.state {
                CircuitState::Closed { accumulated_weight } => {
                    // Stragglers from before the last open/close cycle.
                    if weight <= 0.0 || permit.generation != circuit.generation {
                        return;
                    }
                    let total = accumulated_weight + weight;
                    if total >= self.profile.open_threshold {
                        Some(circuit.transition(
                            &permit.group,
                            CircuitState::Open { opened_at: now },
                            total,
                            now,
                        ))
                    } else {
                        circuit.state = CircuitState::Closed {
                            accumulated_weight: total,
                        };
                        None
                    }
                }
                // Stragglers admitted before the circuit opened.
                CircuitState::Open { .. } => None,
                CircuitState::HalfOpen {
                    probes_issued,
                    probes_succeeded,
                } => {
                    if !permit.probe || permit.generation != circuit.generation {
                        return;
                    }
                    if weight > 0.0 {
                        Some(circuit.transition(
                            &permit.group,
                            CircuitState::Open { opened_at: now },
                            weight,
                            now,
                        ))
                    } else if probes_succeeded + 1 >= self.profile.half_open_probe_count {
                        Some(circuit.transition(
                            &permit.group,
                            CircuitState::default(),
                            0.0,
                            now,
                        ))
                    } else {
                        circuit.state = CircuitState::HalfOpen {
                            probes_issued,
                            probes_succeeded: probes_succeeded + 1,
                        };
                        None
                    }
                }
            }
        };

        if let Some(transition) = transition {
            self.notify(&transition);
        }
    }

    fn notify(&self, transition: &Transition) {
        match transition.to {
            StateKind::Open => tracing::warn!(
                group = %transition.group,
                from = %transition.from,
                weight = transition.accumulated_weight,
                cooldown = ?self.profile.half_open_after,
                "Circuit opened"
            ),
            StateKind::HalfOpen => tracing::info!(
                group = %transition.group,
                probes = self.profile.half_open_probe_count,
                "Circuit transitioning to half-open for recovery test"
            ),
            StateKind::Closed => tracing::info!(
                group = %transition.group,
                "Circuit closed after successful recovery"
            ),
        }

        if let Some(listener) = &self.listener {
            listener(transition);
        }
    }

    /// Get current state of a circuit.
    pub fn state(&self, group: &EndpointGroup) -> CircuitState {
        self.circuits
            .lock()
            .get(group)
            .map(|c| c.state)
            .unwrap_or_default()
    }

    /// Accumulated weight of a closed circuit; zero otherwise.
    pub fn accumulated_weight(&self, group: &EndpointGroup) -> f64 {
        self.state(group).weight()
    }

    /// How many times the circuit has opened.
    pub fn times_opened(&self, group: &EndpointGroup) -> u64 {
        self.circuits
            .lock()
            .get(group)
            .map_or(0, |c| c.times_opened)
    }

    /// Reset all circuits to closed.
    pub fn reset(&self) {
        self.circuits.lock().clear();
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(BreakerProfile::default(), FailureWeights::default())
    }
}
