//! A stream multiplexing protocol: many independent, full-duplex byte
//! streams over a single reliable transport such as TCP or TLS.
//!
//! A [`Session`] wraps the transport and lets both sides open and accept
//! streams concurrently. Every [`Stream`] gets ordered delivery, per-stream
//! credit-based flow control, half-close, abortive reset, and read/write
//! deadlines. Sessions terminate gracefully with a GOAWAY frame carrying a
//! diagnostic payload.
//!
//! # Examples
//!
//! Dial a server, open a stream, and exchange bytes:
//!
//! ```rust,no_run
//! use muxado::Session;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let session = Session::connect("localhost:4000").await?;
//!
//!     let stream = session.open()?;
//!     stream.write(b"hello").await?;
//!     stream.close_write().await?;
//!
//!     let mut reply = Vec::new();
//!     let mut chunk = [0u8; 4096];
//!     loop {
//!         let n = stream.read(&mut chunk).await?;
//!         if n == 0 {
//!             break;
//!         }
//!         reply.extend_from_slice(&chunk[..n]);
//!     }
//!
//!     session.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! Serve the other side of the transport:
//!
//! ```rust,no_run
//! use muxado::{Config, Session};
//! use tokio::net::TcpListener;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let listener = TcpListener::bind("localhost:4000").await?;
//!     let (socket, _) = listener.accept().await?;
//!     let session = Session::server(socket, Config::default());
//!
//!     while let Ok(stream) = session.accept().await {
//!         tokio::spawn(async move {
//!             let mut chunk = [0u8; 4096];
//!             while let Ok(n) = stream.read(&mut chunk).await {
//!                 if n == 0 || stream.write(&chunk[..n]).await.is_err() {
//!                     break;
//!                 }
//!             }
//!         });
//!     }
//!     Ok(())
//! }
//! ```

mod buffer;
pub mod error;
pub mod frame;
pub mod framer;
pub mod session;
pub mod stream;
mod stream_map;
mod window;


pub use error::{Error, ErrorCode, Result};
pub use frame::StreamId;
pub use session::{Config, Session, SessionAddr, DEFAULT_WINDOW_SIZE};
pub use stream::Stream;
