use std::net::{Ipv4Addr, TcpListener};

/// Ask the OS for a currently unused port on the loopback interface.
///
/// The port is released before returning, so another process could take it
/// before the dev server binds. That window is accepted for a development tool.
pub fn find_available_port() -> std::io::Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    Ok(listener.local_addr()?.port())
}
