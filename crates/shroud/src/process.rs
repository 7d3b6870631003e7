//! Code to adjust process-related parameters.

/// Ask the OS for a file-descriptor budget that fits this proxy's
/// workload.
///
/// Every proxied connection holds two sockets, one per side, so the
/// request is sized from the number of configured listeners rather than
/// asking for some fixed maximum. Falling short is not fatal; it just
/// caps how many connections we can carry at once.
pub(crate) fn raise_file_limit(n_listeners: usize) {
    /// How many simultaneous connections we budget per listener.
    const CONNS_PER_LISTENER: u64 = 4096;
    /// Sockets per proxied connection: the accepted one and the dialed
    /// one.
    const FDS_PER_CONN: u64 = 2;
    /// Floor covering stdio, the runtime, and the accept sockets
    /// themselves.
    const BASELINE: u64 = 64;

    let wanted = BASELINE + (n_listeners as u64) * CONNS_PER_LISTENER * FDS_PER_CONN;
    match rlimit::increase_nofile_limit(wanted) {
        Ok(got) if got < wanted => tracing::warn!(
            "File limit is {} (wanted {}); heavy load may run out of sockets",
            got,
            wanted
        ),
        Ok(got) => tracing::debug!("File limit is now {}", got),
        Err(e) => tracing::warn!("Error while adjusting the file limit: {}", e),
    }
}
