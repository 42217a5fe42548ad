//! A stream-multiplexing session: many logical, ordered, flow-controlled byte streams
//! carried over a single reliable duplex transport.
//!
//! ```rust,no_run
//! use muxsession::session::{Session, SessionConfig};
//! use tokio::net::TcpStream;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let socket = TcpStream::connect("127.0.0.1:7000").await?;
//!     let session = Session::new(socket, SessionConfig::new(true));
//!
//!     let mut stream = session.open_stream().await?;
//!     tokio::io::AsyncWriteExt::write_all(&mut stream, b"hello").await?;
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod connection;
pub mod error;
pub mod session;
pub mod shaper;
pub mod stream;
pub mod stream_table;
pub mod token_bucket;

pub use error::{Error, Result, TerminalState};
pub use session::{Session, SessionConfig};
pub use stream::MuxStream;
