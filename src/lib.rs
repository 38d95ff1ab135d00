mod error;

pub mod gateway;

pub use error::{HeimdallError, Result};
pub use gateway::{
    Clock, GatewayConfig, GatewayError, Heimdall, RequestContext, SubjectKey, SubjectType,
    SystemClock,
};
