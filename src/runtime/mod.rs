pub mod plan;
pub mod readiness;
pub mod registry;
pub mod relay;
pub mod router;

pub use plan::{stage_payload, StagePlan};
pub use readiness::{ReadinessError, ReadinessGate, DEFAULT_POLL_INTERVAL};
pub use registry::{EndpointRegistry, EndpointSnapshot, Liveness, OutstandingGuard, StageEndpoint};
pub use relay::{DisconnectWatch, RelayStream};
pub use router::{ProxyResponse, StageRouter};
