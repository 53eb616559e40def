//! Simulation, prediction and reconciliation

pub mod actor;
pub mod history;
pub mod physics;
pub mod reconcile;
pub mod smoothing;
pub mod snapshot;
pub mod state;
pub mod world;

pub use actor::{ActorView, AuthoritativeActor, InputDisposition, PredictedActor};
pub use history::HistoryBuffer;
pub use physics::{BoostPhase, DriveModel, DriveStatus, DriveTuning, Simulator};
pub use reconcile::{
    AnomalySink, Divergence, ReconcileOutcome, ReconciliationEngine, Tolerance, TracingAnomalySink,
};
pub use state::{ActionFlags, ActorId, AuthoritativeSnapshot, InputFrame, PhysicalState};
pub use world::{World, WorldCommand, WorldError, WorldHandle, WorldRegistry};
