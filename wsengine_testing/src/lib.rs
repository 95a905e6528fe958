//! Utilities for driving a [`wsengine::Server`] over real sockets in tests.
//!
//! [`TestClient`] speaks just enough of the WebSocket protocol to exercise
//! the server, including sending deliberately malformed frames. The
//! integration helpers start servers on free ports and record the events
//! their handlers receive.
//!
//! ```rust,no_run
//! use wsengine_testing::{TestClient, TestResult, echo_recorder, start_server};
//!
//! # async fn example() -> TestResult {
//! let (handler, mut events) = echo_recorder();
//! let server = start_server(handler)?;
//! let mut client = TestClient::connect(server.local_addr()).await?;
//! events.connected().await?;
//! client.send_text("hello").await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod integration_helpers;
pub mod logging;

pub use client::{
    CLIENT_KEY,
    CLIENT_MASK,
    READ_TIMEOUT,
    ReceivedFrame,
    TestClient,
    encode_frame,
    upgrade_request,
};
pub use integration_helpers::{
    EventLog,
    RecordedEvent,
    TestResult,
    echo_recorder,
    recorder,
    start_server,
    start_with,
    unused_listener,
};
pub use logging::{LoggerHandle, logger};
