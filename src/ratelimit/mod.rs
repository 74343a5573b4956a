//! Rate limiting decisions and identity handling.

mod clock;
mod identity;
mod limiter;

pub use clock::{saturating_add, Clock, ManualClock, SystemClock};
pub use identity::{hash_token, mask_token, IdentityClass, IdentityKey};
pub use limiter::{Decision, RateLimiter, QUOTA_EXCEEDED_MESSAGE};
