//! sandbox-broker: challenge-gated shell command execution inside per-session containers.
//!
//! Re-exports the public types of every module.

pub mod audit;
pub mod broker;
pub mod challenge;
pub mod config;
pub mod container;
pub mod error;
pub mod executor;
pub mod introspect;
pub mod persistence;
pub mod policy;
pub mod runtime;
pub mod session;

pub use audit::{TranscriptLog, TranscriptRecord};
pub use broker::{Broker, BrokerRequest, BrokerResponse};
pub use challenge::{Challenge, ChallengeStore, ChallengeSubject, VerifyOutcome};
pub use config::{BrokerConfig, ContainerConfig, TranscriptConfig};
pub use container::{resolve_project_path, ContainerManager, SessionContainer};
pub use error::{BrokerError, StoreError};
pub use executor::{CommandExecutor, ExecutionResult};
pub use introspect::{Introspector, RecordingIntrospector, TracingIntrospector};
pub use persistence::{FileStore, KeyedStore, MemoryStore};
pub use policy::{policy_summary, CommandPolicy, Rejection};
pub use runtime::{ContainerRuntime, ContainerSpec, ContainerState, DockerRuntime, ExecOutput};
pub use session::{SessionId, SessionRegistry};
