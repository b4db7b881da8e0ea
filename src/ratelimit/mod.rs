//! Rate limiting logic.

mod backend;
mod clock;
mod key;
mod limiter;
mod quota;
mod window;

pub use backend::AdmissionBackend;
pub use clock::{Clock, ManualClock, SystemClock};
pub use key::{RateKey, DEFAULT_KEY_PREFIX};
pub use limiter::{Decision, RateLimiter};
pub use quota::{AdmissionMode, QuotaConfig, MAX_WINDOW_SIZE_SECONDS};
pub use window::{window_start, WindowEntry};
