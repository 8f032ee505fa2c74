//! Emulator Helpers
//!
//! Serial/port mapping for emulator instances and the console-based
//! kill path used when freeing a launched emulator.

use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::debug;

/// Console port of the first emulator slot
pub const DEFAULT_CONSOLE_PORT: u16 = 5554;
/// Consecutive emulator slots are two ports apart
pub const EMULATOR_PORT_STEP: u16 = 2;

const CONSOLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Extract the console port from an `emulator-<port>` serial
pub fn emulator_port(serial: &str) -> Option<u16> {
    serial.strip_prefix("emulator-")?.parse().ok()
}

/// Serial for an emulator on the given console port
pub fn emulator_serial(port: u16) -> String {
    format!("emulator-{}", port)
}

/// Ask the emulator console on localhost to shut the instance down.
///
/// Best effort: callers fall back to destroying the emulator process
/// when the console is unreachable.
pub async fn console_kill(port: u16) -> std::io::Result<()> {
    let result = tokio::time::timeout(CONSOLE_TIMEOUT, async {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await?;
        stream.write_all(b"kill\n").await?;
        stream.shutdown().await
    })
    .await;
    match result {
        Ok(inner) => inner,
        Err(_) => {
            debug!("emulator console on port {} did not answer", port);
            Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "emulator console timeout",
            ))
        }
    }
}
