// Out-of-process inference worker
//
// - protocol.rs: line-delimited JSON codec
// - supervisor.rs: process lifecycle (spawn, ready handshake, exit detection)
// - coordinator.rs: request/response correlation, progress routing, timeouts
// - engine.rs: InferenceEngine implementation on top of the coordinator
// - discovery.rs: locating the worker executable

pub mod coordinator;
pub mod discovery;
pub mod engine;
pub mod protocol;
pub mod supervisor;

pub use coordinator::{CallError, CallOptions, ProgressCallback, ProgressUpdate, RequestCoordinator};
pub use discovery::find_worker_path;
pub use engine::{WorkerEngine, WorkerTimeouts};
pub use protocol::{
    classify, decode_line, encode, kinds, Inbound, LineDecoder, ProtocolError, RequestIdGenerator,
    WireMessage,
};
pub use supervisor::{
    WorkerError, WorkerExit, WorkerInfo, WorkerListener, WorkerSpec, WorkerSupervisor,
};
