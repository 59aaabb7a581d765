//! Services layer for the token broker.
//!
//! Business logic: discovery reconciliation, permission resolution, token
//! issuance/validation, the A2A broker, and the supporting stores.

pub mod a2a;
pub mod discovery;
pub mod error;
pub mod idp;
pub mod keys;
pub mod registry;
pub mod resolver;
pub mod revocation;
pub mod store;
pub mod sweeper;
pub mod token;

pub use a2a::{A2aBroker, ServiceTokenResponse};
pub use discovery::{DiscoveryReport, DiscoveryService, validate_document};
pub use error::{BrokerError, ErrorClass};
pub use idp::{IdentityProvider, OidcIdentityProvider, StaticIdentityProvider, VerifiedPrincipal};
pub use keys::{JwkSet, JsonWebKey, KeyRing};
pub use registry::CapabilityRegistry;
pub use resolver::{PermissionResolver, ResolvedPermissions, resolve_permission_set};
pub use revocation::{MemoryRevocationIndex, RedisRevocationIndex, RevocationIndex};
pub use store::{BrokerStore, MemoryStore, RotateOutcome};
pub use sweeper::spawn_sweeper;
pub use token::{INTERNAL_AUDIENCE, TokenRejection, TokenResponse, TokenService};
