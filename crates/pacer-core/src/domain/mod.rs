//! Domain model (quotas, errors, events, status views).

pub mod errors;
pub mod events;
pub mod quota;
pub mod status;

pub use self::errors::{ApiError, ConfigError, ErrorKind, LimiterError};
pub use self::events::{AdmissionKind, PacerEvent};
pub use self::quota::{QuotaSpec, QuotaTable, RateLimitConfig};
pub use self::status::KeyStatus;
