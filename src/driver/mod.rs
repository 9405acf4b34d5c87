//! Driver webhook protocol and invocation client

mod client;
pub mod protocol;

pub use client::{
    CreateResult, DriverClient, DriverRef, DriverTransport, GenerateResult, HttpTransport,
    TransportError, parse_duration,
};
pub use protocol::{Operation, OperationOutcome, RetryIds};
