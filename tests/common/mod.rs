#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::mpsc;

use radiolink::e2e_common::{RadioScript, ScriptedRadio};
use radiolink::{BuildInfo, Diagnostic, MemoryTransport, Session, SessionConfig, SessionError};

pub const WAIT: Duration = Duration::from_secs(3);

pub fn peer() -> SocketAddr {
    "192.0.2.10:4992".parse().unwrap()
}

/// Opens a session against a scripted radio over the in-memory transport.
pub async fn open_with(
    config: SessionConfig,
    script: RadioScript,
) -> Result<(Session, ScriptedRadio, MemoryTransport), SessionError> {
    let (transport, radio) = MemoryTransport::pair();
    let radio = ScriptedRadio::spawn(radio, script);
    let session = Session::open(peer(), config, BuildInfo::current(), &transport).await?;
    Ok((session, radio, transport))
}

pub async fn open_bare(script: RadioScript) -> (Session, ScriptedRadio, MemoryTransport) {
    open_with(SessionConfig::bare(), script).await.unwrap()
}

/// Next diagnostic, failing the test if none arrives in time.
pub async fn next_diagnostic(rx: &mut mpsc::UnboundedReceiver<Diagnostic>) -> Diagnostic {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for a diagnostic")
        .expect("diagnostic channel closed")
}

/// Skips diagnostics until `pick` accepts one.
pub async fn wait_diagnostic<T>(
    rx: &mut mpsc::UnboundedReceiver<Diagnostic>,
    mut pick: impl FnMut(&Diagnostic) -> Option<T>,
) -> T {
    loop {
        let diagnostic = next_diagnostic(rx).await;
        if let Some(found) = pick(&diagnostic) {
            return found;
        }
    }
}
