//! Duplex byte relay fronting a backend connector with a local listener.
//!
//! Makes a remote or indirect job broker look like a local engine: every
//! connection accepted on the frontend is paired with one backend
//! connection and raw bytes are copied both ways until each side finishes.

use std::sync::Arc;

use crate::connector::{BoxedConn, Connector};
use crate::error::EngineError;

/// Accept connections on `frontend` and relay each to a fresh `backend`
/// connection. A failed backend connect only ends that relay; the accept
/// loop runs until the frontend itself fails, and that failure is returned
/// to the caller.
pub async fn proxy(
    frontend: Arc<dyn Connector>,
    backend: Arc<dyn Connector>,
) -> Result<(), EngineError> {
    loop {
        let conn = frontend.accept().await?;
        let backend = backend.clone();
        tokio::spawn(async move {
            if let Err(e) = relay(conn, backend.as_ref()).await {
                tracing::debug!("relay ended: {e}");
            }
            // The frontend connection drops here either way, so a failed
            // backend connect leaks nothing.
        });
    }
}

/// Copy bytes both ways between `frontend` and one new backend connection
/// until both directions have finished.
pub async fn relay(mut frontend: BoxedConn, backend: &dyn Connector) -> Result<(), EngineError> {
    let mut back = backend.connect().await?;
    let _ = tokio::io::copy_bidirectional(&mut frontend, &mut back).await;
    Ok(())
}
