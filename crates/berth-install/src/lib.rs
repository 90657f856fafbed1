//! Install-plan materialization: the plan model, fetch orchestration, runner
//! resolution, and runtime environment preparation.

pub mod env;
pub mod materialize;
pub mod plan;
pub mod runner;

pub use env::{prepare_env, EnvPrepareError, EnvPrepareOptions, EnvReport};
pub use materialize::{materialize, BuildReport, MaterializeError, MaterializeOptions, StepError};
pub use plan::{ArtifactSpec, InstallPlan, PlanFile};
pub use runner::{
    load_runner, resolve_runner, ResolvedRunner, RunnerDescriptor, RunnerKind, RunnerResolveError,
    RUNNER_FILE,
};
