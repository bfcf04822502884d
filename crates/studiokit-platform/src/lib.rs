pub mod hardware;
pub mod locate;
pub mod process;
pub mod signal;

pub use hardware::{recognition_threads, GpuInfo, HardwareProfile};
pub use locate::{Candidate, Located, ProgramProbe, RuntimeStatus, SystemProbe};
pub use process::{ExitInfo, ManagedProcess, ProcessSpec, ProcessState, ReadySignal, RunOutput};
