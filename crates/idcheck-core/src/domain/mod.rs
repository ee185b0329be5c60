//! Domain model: plain data, no I/O.

pub mod envelope;
pub mod errors;
pub mod identity;
pub mod ids;
pub mod outcome;
pub mod request;

pub use envelope::{Message, MessageProperties, OutgoingMessage};
pub use errors::{
    BusError, ConnectivityError, DuplicateCorrelation, ErrorKind, RegistryError, RpcError,
};
pub use identity::{IdentityRecord, reference_identities};
pub use ids::{ConnectionId, CorrelationId, Id, IdMarker, ParseIdError};
pub use outcome::{ContactPartition, MatchedContact, ValidationResponse, ValidationStatus};
pub use request::{DNI_LEN, RegistrationRequest, is_well_formed_dni};
