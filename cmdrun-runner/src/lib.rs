pub mod deadline;
pub mod debug;
pub mod drain;
pub mod process;
pub mod supervisor;
pub mod template;

pub use deadline::{resolve_signal, DeadlinePoint, DeadlineSequence, Escalation};
pub use debug::{
    default_debug_log, install_default_debug_log, DebugLog, DebugSink, DefaultDebugLogGuard,
};
pub use drain::OutputDrainer;
pub use supervisor::{run, ProcessSupervisor};
pub use template::{CommandTemplate, RunOverrides, TemplateDefaults};
