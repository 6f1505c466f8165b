//! Wire-level collaborator: connects to the target, speaks the HTTP/2 frame
//! layer and reports what the server sends as [`h2sec_traits::Event`]s.

pub mod codec;
pub mod conn;
pub mod tls;
pub mod transport;

pub use conn::TcpDialer;
